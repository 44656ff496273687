/* --------------------------
Client-side state store
    - Latest known sections, albums, songs and per-task status, shared by
      everything that presents or mutates catalog data.
    - Refresh calls replace whole slices; status events upsert by request key.
      Each slice is locked on its own, so a reader may see sections updated
      before songs during a combined refresh.
    - Mutations bump a revision published on a watch channel; consumers hold
      the receiver and re-read whatever slice they care about.
-------------------------- */

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use indexmap::IndexMap;
use tokio::sync::{watch, Mutex};

use crate::cache::CoverCache;
use crate::client::{Client, ClientError, Login, Song, StatusKind, StatusMap, TaskStatus};
use crate::config::Credentials;
use crate::status::StatusChannel;

/// One logged-in session's state. Cheap to clone; all clones share the same
/// store. Created by connect() and dropped on logout; there is no way to
/// hold one without a client behind it.
#[derive(Clone)]
pub struct AppState {
    client: Arc<Client>,
    inner: Arc<StateInner>,
}

struct StateInner {
    sections: RwLock<Vec<String>>,
    albums: RwLock<Vec<String>>,
    songs: RwLock<IndexMap<String, Vec<Song>>>,
    statuses: RwLock<StatusMap>,
    channel: Mutex<Option<Arc<StatusChannel>>>,
    covers: CoverCache,
    changes: watch::Sender<u64>,
}

/// Authenticates against the server and builds the session state: probes the
/// API, opens the status channel and runs the initial catalog refreshes.
/// An Unauthorized error here means wrong credentials; anything else is the
/// server being unreachable.
pub async fn connect(credentials: &Credentials, cover_dir: PathBuf) -> Result<AppState, ClientError> {
    let client = Client::new(
        &credentials.host,
        credentials.port,
        Login {
            username: credentials.username.clone(),
            password: credentials.password.clone(),
        },
    )?;
    client.api_test().await?;

    let state = AppState::new(Arc::new(client), cover_dir);
    state.ensure_status_channel().await;
    state.refresh_sections_and_songs().await?;
    state.refresh_albums().await?;
    Ok(state)
}

impl AppState {
    pub fn new(client: Arc<Client>, cover_dir: PathBuf) -> Self {
        let (changes, _) = watch::channel(0);
        let covers = CoverCache::new(client.clone(), cover_dir);
        Self {
            client,
            inner: Arc::new(StateInner {
                sections: RwLock::new(Vec::new()),
                albums: RwLock::new(Vec::new()),
                songs: RwLock::new(IndexMap::new()),
                statuses: RwLock::new(HashMap::new()),
                channel: Mutex::new(None),
                covers,
                changes,
            }),
        }
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    pub fn covers(&self) -> &CoverCache {
        &self.inner.covers
    }

    /// Receiver for the revision counter; changes whenever any slice does.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.changes.subscribe()
    }

    pub fn sections(&self) -> Vec<String> {
        self.inner.sections.read().expect("sections poisoned").clone()
    }

    pub fn albums(&self) -> Vec<String> {
        self.inner.albums.read().expect("albums poisoned").clone()
    }

    pub fn songs(&self) -> IndexMap<String, Vec<Song>> {
        self.inner.songs.read().expect("songs poisoned").clone()
    }

    pub fn statuses(&self) -> StatusMap {
        self.inner.statuses.read().expect("statuses poisoned").clone()
    }

    pub async fn refresh_sections(&self) -> Result<(), ClientError> {
        let sections = self.client.sections().await?;
        *self.inner.sections.write().expect("sections poisoned") = sections;
        self.bump();
        Ok(())
    }

    pub async fn refresh_albums(&self) -> Result<(), ClientError> {
        let albums = self.client.albums().await?;
        *self.inner.albums.write().expect("albums poisoned") = albums;
        self.bump();
        Ok(())
    }

    /// Replaces the song map and derives the section list from its keys.
    pub async fn refresh_sections_and_songs(&self) -> Result<(), ClientError> {
        let songs = self.client.sections_and_songs().await?;
        let sections: Vec<String> = songs.keys().cloned().collect();
        *self.inner.songs.write().expect("songs poisoned") = songs;
        *self.inner.sections.write().expect("sections poisoned") = sections;
        self.bump();
        Ok(())
    }

    /// Returns the session's status channel, replacing an instance that is no
    /// longer running. A fresh channel gets the store registered as its first
    /// observer.
    pub async fn ensure_status_channel(&self) -> Arc<StatusChannel> {
        let mut guard = self.inner.channel.lock().await;
        if let Some(channel) = guard.as_ref() {
            if channel.running() {
                return channel.clone();
            }
            // a stale instance is never reused; make sure it is also gone
            channel.stop();
        }

        let channel = Arc::new(StatusChannel::open(self.client.socket_url()));
        let state = self.clone();
        channel.subscribe(Arc::new(move |status| state.apply_status(status)));
        *guard = Some(channel.clone());
        channel
    }

    /// Tears the session down: the channel is stopped and awaited, catalog
    /// slices are cleared and the token dropped. Cached cover images survive
    /// so a reconnect does not re-download them.
    pub async fn disconnect(&self) {
        let channel = self.inner.channel.lock().await.take();
        if let Some(channel) = channel {
            channel.stop();
            channel.join().await;
        }

        self.inner.sections.write().expect("sections poisoned").clear();
        self.inner.albums.write().expect("albums poisoned").clear();
        self.inner.songs.write().expect("songs poisoned").clear();
        self.inner.statuses.write().expect("statuses poisoned").clear();
        self.bump();

        self.client.logout(false).await;
    }

    /// Keyed upsert from one status event; the newest event for a request
    /// always wins. A finished download changes the server's catalog, so it
    /// schedules one sections/songs refresh.
    fn apply_status(&self, status: TaskStatus) {
        let finished = status.status == StatusKind::Finished;
        self.inner
            .statuses
            .write()
            .expect("statuses poisoned")
            .insert(status.request.clone(), status);
        self.bump();

        if finished {
            let state = self.clone();
            tokio::spawn(async move {
                if let Err(e) = state.refresh_sections_and_songs().await {
                    log::error!("catalog refresh after a finished task failed: {}", e);
                }
            });
        }
    }

    fn bump(&self) {
        self.inner.changes.send_modify(|revision| *revision += 1);
    }
}
