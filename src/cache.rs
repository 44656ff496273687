/* --------------------------
Album cover cache
    - One observable slot per album; consumers hold a watch receiver and get
      the image bytes whenever they land.
    - Covers are kept as PNG files named by album under the app's albums
      directory. A disk hit is validated against the server's reported
      modification date before it is trusted.
    - A "currently refreshing" set makes sure concurrent requests for the
      same album cost one network fetch.
-------------------------- */

use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::client::{Client, ClientError};

pub type CoverBytes = Arc<Vec<u8>>;

#[derive(Clone)]
pub struct CoverCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    client: Arc<Client>,
    dir: PathBuf,
    slots: RwLock<HashMap<String, watch::Sender<Option<CoverBytes>>>>,
    refreshing: Mutex<HashSet<String>>,
}

impl CoverCache {
    pub fn new(client: Arc<Client>, dir: PathBuf) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                client,
                dir,
                slots: RwLock::new(HashMap::new()),
                refreshing: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Returns the album's slot, kicking off a load if needed. A slot that
    /// already has an image is revalidated in the background; one that is
    /// still loading is returned as-is.
    pub fn get_or_load(&self, album: &str) -> watch::Receiver<Option<CoverBytes>> {
        {
            let slots = self.inner.slots.read().expect("cover slots poisoned");
            if let Some(sender) = slots.get(album) {
                let receiver = sender.subscribe();
                if receiver.borrow().is_some() {
                    self.refresh(album, sender.clone());
                }
                return receiver;
            }
        }

        let (sender, receiver) = watch::channel(None);
        self.inner
            .slots
            .write()
            .expect("cover slots poisoned")
            .insert(album.to_string(), sender.clone());
        self.refresh(album, sender);
        receiver
    }

    /// Throws away the slot's current value and reloads, disk check included.
    pub fn force_refresh(&self, album: &str) {
        let sender = {
            let slots = self.inner.slots.read().expect("cover slots poisoned");
            slots.get(album).cloned()
        };
        if let Some(sender) = sender {
            sender.send_replace(None);
            self.refresh(album, sender);
        }
    }

    fn refresh(&self, album: &str, slot: watch::Sender<Option<CoverBytes>>) {
        {
            let mut refreshing = self.inner.refreshing.lock().expect("refresh set poisoned");
            if !refreshing.insert(album.to_string()) {
                return;
            }
        }

        let inner = self.inner.clone();
        let album = album.to_string();
        tokio::spawn(async move {
            if let Err(e) = load_cover(&inner, &album, &slot).await {
                log::warn!("cover load for '{}' failed: {}", album, e);
            }
            inner
                .refreshing
                .lock()
                .expect("refresh set poisoned")
                .remove(&album);
        });
    }
}

async fn load_cover(
    inner: &CacheInner,
    album: &str,
    slot: &watch::Sender<Option<CoverBytes>>,
) -> Result<(), ClientError> {
    let path = cover_path(&inner.dir, album);

    if let Some(local_modified) = file_modified(&path).await {
        let server_modified = inner.client.album_cover_modified(album).await?;
        if DateTime::from_timestamp_millis(server_modified).unwrap_or(DateTime::<Utc>::MIN_UTC)
            < local_modified
        {
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|e| ClientError::Other(format!("cover read failed: {}", e)))?;
            slot.send_replace(Some(Arc::new(bytes)));
            return Ok(());
        }
    }

    let raw = inner.client.album_cover(album).await?;
    let decoded = image::load_from_memory(&raw)
        .map_err(|e| ClientError::Other(format!("cover image invalid: {}", e)))?;
    let mut png = Vec::new();
    decoded
        .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
        .map_err(|e| ClientError::Other(format!("cover encode failed: {}", e)))?;

    // a failed write is not fatal; the in-memory image is still published
    if let Err(e) = tokio::fs::write(&path, &png).await {
        log::warn!("could not persist cover for '{}': {}", album, e);
    }

    slot.send_replace(Some(Arc::new(png)));
    Ok(())
}

fn cover_path(dir: &Path, album: &str) -> PathBuf {
    let file = album.replace(['/', '\\'], "_");
    dir.join(format!("{}.png", file))
}

async fn file_modified(path: &Path) -> Option<DateTime<Utc>> {
    let metadata = tokio::fs::metadata(path).await.ok()?;
    let modified: SystemTime = metadata.modified().ok()?;
    Some(DateTime::<Utc>::from(modified))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Login;
    use crate::testutil::{self, fixed, json};
    use std::collections::HashMap as RouteMap;
    use std::time::Duration;

    fn png_bytes() -> Vec<u8> {
        let img = image::DynamicImage::new_rgb8(2, 2);
        let mut out = Vec::new();
        img.write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
            .unwrap();
        out
    }

    async fn cache_with_routes(
        routes: RouteMap<String, testutil::Responder>,
    ) -> (CoverCache, testutil::MockHttp, tempfile::TempDir) {
        let server = testutil::serve(routes).await;
        let client = Client::new(
            "127.0.0.1",
            server.port,
            Login {
                username: "user".to_string(),
                password: "pass".to_string(),
            },
        )
        .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let cache = CoverCache::new(Arc::new(client), dir.path().to_path_buf());
        (cache, server, dir)
    }

    async fn wait_for_image(receiver: &mut watch::Receiver<Option<CoverBytes>>) -> CoverBytes {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(bytes) = receiver.borrow().clone() {
                    return bytes;
                }
                receiver.changed().await.unwrap();
            }
        })
        .await
        .expect("cover never arrived")
    }

    #[tokio::test]
    async fn concurrent_requests_for_one_album_fetch_once() {
        let mut routes = RouteMap::new();
        routes.insert(
            "GET /api/get/albumCover".to_string(),
            fixed(200, "image/png", png_bytes()),
        );
        let (cache, server, _dir) = cache_with_routes(routes).await;

        let mut first = cache.get_or_load("X");
        let mut second = cache.get_or_load("X");

        let a = wait_for_image(&mut first).await;
        let b = wait_for_image(&mut second).await;
        assert_eq!(a, b);
        assert_eq!(server.hits("GET /api/get/albumCover"), 1);
        // no local file, so the modification date is never consulted
        assert_eq!(server.hits("GET /api/get/albumCoverModificationDate"), 0);
    }

    #[tokio::test]
    async fn fetched_cover_is_persisted_as_png() {
        let mut routes = RouteMap::new();
        routes.insert(
            "GET /api/get/albumCover".to_string(),
            fixed(200, "image/png", png_bytes()),
        );
        let (cache, _server, dir) = cache_with_routes(routes).await;

        let mut slot = cache.get_or_load("My Album");
        wait_for_image(&mut slot).await;

        let path = dir.path().join("My Album.png");
        let bytes = std::fs::read(path).unwrap();
        assert!(image::load_from_memory(&bytes).is_ok());
    }

    #[tokio::test]
    async fn fresh_disk_copy_is_used_without_a_fetch() {
        let mut routes = RouteMap::new();
        // server copy is from 1970, far older than the file we just wrote
        routes.insert(
            "GET /api/get/albumCoverModificationDate".to_string(),
            json("0"),
        );
        let (cache, server, dir) = cache_with_routes(routes).await;

        std::fs::write(dir.path().join("X.png"), png_bytes()).unwrap();

        let mut slot = cache.get_or_load("X");
        let bytes = wait_for_image(&mut slot).await;
        assert!(image::load_from_memory(&bytes).is_ok());
        assert_eq!(server.hits("GET /api/get/albumCoverModificationDate"), 1);
        assert_eq!(server.hits("GET /api/get/albumCover"), 0);
    }

    #[tokio::test]
    async fn stale_disk_copy_is_refetched() {
        let far_future = (Utc::now().timestamp_millis() + 3_600_000).to_string();
        let mut routes = RouteMap::new();
        routes.insert(
            "GET /api/get/albumCoverModificationDate".to_string(),
            json(&far_future),
        );
        routes.insert(
            "GET /api/get/albumCover".to_string(),
            fixed(200, "image/png", png_bytes()),
        );
        let (cache, server, dir) = cache_with_routes(routes).await;

        std::fs::write(dir.path().join("X.png"), png_bytes()).unwrap();

        let mut slot = cache.get_or_load("X");
        wait_for_image(&mut slot).await;
        assert_eq!(server.hits("GET /api/get/albumCover"), 1);
    }

    #[tokio::test]
    async fn undecodable_cover_bytes_leave_the_slot_empty() {
        let mut routes = RouteMap::new();
        routes.insert(
            "GET /api/get/albumCover".to_string(),
            fixed(200, "image/png", b"not an image".to_vec()),
        );
        let (cache, _server, _dir) = cache_with_routes(routes).await;

        let receiver = cache.get_or_load("X");
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(receiver.borrow().is_none());
    }
}
