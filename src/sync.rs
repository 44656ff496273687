/* --------------------------
Section audio sync
    - Mirrors one section's songs into a local directory as
      "{album} - {name}.mp3". Files that already exist are left alone, so a
      re-run only fetches what is new.
    - One song failing to download or write does not abort the rest.
-------------------------- */

use std::path::Path;

use crate::client::{Client, ClientError};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Downloads every song of `section` into `target`. The target directory is
/// created if missing. Listing the section is the only fatal failure; from
/// there each song is handled on its own.
pub async fn sync_section(
    client: &Client,
    section: &str,
    target: &Path,
) -> Result<SyncReport, ClientError> {
    let songs = client.songs(section).await?;
    tokio::fs::create_dir_all(target)
        .await
        .map_err(|e| ClientError::Other(format!("cannot create {}: {}", target.display(), e)))?;

    let mut report = SyncReport::default();
    for (index, song) in songs.iter().enumerate() {
        let file_name = format!("{} - {}.mp3", song.album, song.name).replace(['/', '\\'], "_");
        let path = target.join(&file_name);

        if path.exists() {
            log::debug!("already synced: {}", file_name);
            report.skipped += 1;
            continue;
        }

        log::info!("{}/{} {}", index + 1, songs.len(), file_name);
        let data = match client.song_audio(section, &song.name, &song.album).await {
            Ok(data) => data,
            Err(e) => {
                log::error!("download of '{}' failed: {}", file_name, e);
                report.failed += 1;
                continue;
            }
        };

        match tokio::fs::write(&path, &data).await {
            Ok(()) => report.downloaded += 1,
            Err(e) => {
                log::error!("could not write '{}': {}", path.display(), e);
                report.failed += 1;
            }
        }
    }

    Ok(report)
}
