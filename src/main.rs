mod cache;
mod client;
mod config;
mod state;
mod status;
mod sync;
#[cfg(test)]
mod testutil;

use std::sync::Arc;
use std::time::Duration;

use flexi_logger::FileSpec;

use crate::client::{ClientError, StatusType, TaskRequest, TaskStatus};

#[tokio::main]
async fn main() {
    if let Err(e) = config::prepare_directories() {
        println!(" ! Could not prepare directories: {}", e);
        std::process::exit(1);
    }

    let _logger = match flexi_logger::Logger::try_with_env_or_str("info") {
        Ok(logger) => logger
            .log_to_file(
                FileSpec::default()
                    .directory(config::log_dir())
                    .basename("downbeat"),
            )
            .start()
            .ok(),
        Err(_) => None,
    };

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("help");

    match command {
        "help" | "--help" | "-h" => {
            print_usage();
            return;
        }
        "login" => {
            let existing = config::get_credentials().ok().flatten();
            let credentials = config::prompt_credentials(existing);
            if let Err(e) = config::store_credentials(&credentials) {
                println!(" ! Could not store credentials: {}", e);
                std::process::exit(1);
            }
            println!(" - Credentials stored.");
            return;
        }
        "logout" => {
            if let Err(e) = config::clear_credentials() {
                println!(" ! Could not clear credentials: {}", e);
                std::process::exit(1);
            }
            println!(" - Credentials cleared.");
            return;
        }
        _ => {}
    }

    let credentials = match config::get_credentials() {
        Ok(Some(credentials)) if credentials.complete() => credentials,
        Ok(_) => {
            let credentials = config::prompt_credentials(config::get_credentials().ok().flatten());
            if let Err(e) = config::store_credentials(&credentials) {
                println!(" ! Could not store credentials: {}", e);
                std::process::exit(1);
            }
            credentials
        }
        Err(e) => {
            println!(" ! Could not read config: {}", e);
            std::process::exit(1);
        }
    };

    let state = match state::connect(&credentials, config::cover_dir()).await {
        Ok(state) => state,
        Err(ClientError::Unauthorized) => {
            println!(" ! Unauthorized - check username and password (run 'downbeat login').");
            std::process::exit(1);
        }
        Err(e) => {
            println!(" ! Could not connect to {}:{} - {}", credentials.host, credentials.port, e);
            std::process::exit(1);
        }
    };

    let result = run_command(command, &args[1..], &state).await;
    state.disconnect().await;

    if let Err(e) = result {
        println!(" ! {}", e);
        std::process::exit(1);
    }
}

async fn run_command(command: &str, args: &[String], state: &state::AppState) -> Result<(), ClientError> {
    match command {
        "sections" => {
            for section in state.sections() {
                println!("{}", section);
            }
        }
        "albums" => {
            for album in state.albums() {
                println!("{}", album);
            }
        }
        "songs" => {
            let section = required(args, 0, "section");
            for song in state.client().songs(section).await? {
                println!("{} - {} [{}]", song.artist, song.name, song.album);
            }
        }
        "submit" => {
            let request = TaskRequest {
                url: required(args, 0, "url").to_string(),
                name: required(args, 1, "name").to_string(),
                artist: required(args, 2, "artist").to_string(),
                album: required(args, 3, "album").to_string(),
                section: required(args, 4, "section").to_string(),
            };
            state.client().submit_request(&request).await?;
            println!(" - Requested '{}'.", request.name);
        }
        "cancel" => {
            let name = required(args, 0, "name");
            let section = required(args, 1, "section");
            let album = required(args, 2, "album");
            state.client().cancel_request(name, section, album).await?;
            println!(" - Cancelled '{}'.", name);
        }
        "watch" => {
            let channel = state.ensure_status_channel().await;
            channel.subscribe(Arc::new(|status| print_status(&status)));
            channel.request_all().await?;
            println!(" - Watching task status, ctrl-c to quit.");
            let _ = tokio::signal::ctrl_c().await;
            channel.stop();
            channel.join().await;
        }
        "sync" => {
            let section = required(args, 0, "section");
            let target = match args.get(1) {
                Some(dir) => std::path::PathBuf::from(dir),
                None => config::download_dir().join(section),
            };
            let report = sync::sync_section(state.client(), section, &target).await?;
            println!(
                " - Synced '{}': {} downloaded, {} already present, {} failed.",
                section, report.downloaded, report.skipped, report.failed
            );
        }
        "cover" => {
            let album = required(args, 0, "album");
            let mut slot = state.covers().get_or_load(album);
            let waited = tokio::time::timeout(Duration::from_secs(30), async {
                loop {
                    let bytes = slot.borrow().clone();
                    if let Some(bytes) = bytes {
                        return Some(bytes);
                    }
                    if slot.changed().await.is_err() {
                        return None;
                    }
                }
            })
            .await;
            match waited {
                Ok(Some(bytes)) => println!(
                    " - Cover for '{}' ({} bytes) cached at {}",
                    album,
                    bytes.len(),
                    config::cover_dir().join(format!("{}.png", album)).display()
                ),
                _ => return Err(ClientError::Other(format!("no cover for '{}'", album))),
            }
        }
        "create-section" => {
            let name = required(args, 0, "name");
            state.client().create_section(name).await?;
            println!(" - Created section '{}'.", name);
        }
        "create-album" => {
            let name = required(args, 0, "name");
            let image_path = required(args, 1, "image.png");
            let image = std::fs::read(image_path)
                .map_err(|e| ClientError::Other(format!("cannot read {}: {}", image_path, e)))?;
            state.client().create_album(name, image).await?;
            println!(" - Created album '{}'.", name);
        }
        "delete-section" => {
            let name = required(args, 0, "name");
            state.client().delete_section(name).await?;
            println!(" - Deleted section '{}'.", name);
        }
        "delete-album" => {
            let name = required(args, 0, "name");
            state.client().delete_album(name).await?;
            println!(" - Deleted album '{}'.", name);
        }
        "delete-song" => {
            let section = required(args, 0, "section");
            let name = required(args, 1, "name");
            let album = required(args, 2, "album");
            state.client().delete_song(section, name, album).await?;
            println!(" - Deleted '{}'.", name);
        }
        other => {
            println!(" ! Unknown command '{}'", other);
            print_usage();
            std::process::exit(2);
        }
    }
    Ok(())
}

fn print_status(status: &TaskStatus) {
    let progress = match status.status.status_type() {
        StatusType::Percentage => format!("{:3.0}%", status.percentage * 100.0),
        _ => "    ".to_string(),
    };
    println!(
        " {:<12} {} {} - {} [{} / {}]",
        format!("{:?}", status.status).to_uppercase(),
        progress,
        status.request.name,
        status.request.artist,
        status.request.album,
        status.request.section
    );
}

fn required<'a>(args: &'a [String], index: usize, name: &str) -> &'a str {
    match args.get(index) {
        Some(value) => value,
        None => {
            println!(" ! Missing argument <{}>", name);
            print_usage();
            std::process::exit(2);
        }
    }
}

fn print_usage() {
    println!("downbeat {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("usage: downbeat <command> [args]");
    println!();
    println!("  login                                        store server and login data");
    println!("  logout                                       clear stored login data");
    println!("  sections                                     list sections");
    println!("  albums                                       list albums");
    println!("  songs <section>                              list songs of a section");
    println!("  submit <url> <name> <artist> <album> <section>   request a download");
    println!("  cancel <name> <section> <album>              cancel a requested download");
    println!("  watch                                        stream task status updates");
    println!("  sync <section> [dir]                         mirror a section's audio locally");
    println!("  cover <album>                                fetch and cache an album cover");
    println!("  create-section <name>");
    println!("  create-album <name> <image.png>");
    println!("  delete-section <name>");
    println!("  delete-album <name>");
    println!("  delete-song <section> <name> <album>");
}
