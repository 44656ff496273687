/* --------------------------
HTTP client for the downbeat server API
    - This file contains all request/response functions. It defines the Client struct
      which owns the http client, the login data and the cached bearer token.
    - The wire types shared with the status channel are defined at the end of the file.
-------------------------- */

use std::collections::HashMap;

use indexmap::IndexMap;
use reqwest::multipart;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use url::Url;

/// Everything a caller can get back from the server, folded into four kinds
/// so call sites switch on the kind instead of on the failure's origin.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("{0}")]
    Other(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        ClientError::Transport(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::Transport(e.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Login {
    pub username: String,
    pub password: String,
}

#[derive(Debug)]
pub struct Client {
    base_url: Url,
    http_client: reqwest::Client,
    login: RwLock<Option<Login>>,
    token: RwLock<Option<String>>,
}

impl Client {
    pub fn new(host: &str, port: u16, login: Login) -> Result<Self, ClientError> {
        let base_url = Url::parse(&format!("http://{}:{}", host, port))
            .map_err(|e| ClientError::Other(format!("invalid host '{}': {}", host, e)))?;

        Ok(Self {
            base_url,
            http_client: reqwest::Client::new(),
            login: RwLock::new(Some(login)),
            token: RwLock::new(None),
        })
    }

    fn endpoint(&self, path: &str) -> Url {
        let mut url = self.base_url.clone();
        url.set_path(path);
        url
    }

    /// URL of the persistent status channel.
    pub fn socket_url(&self) -> String {
        let mut url = self.endpoint("/api/socket/status");
        // the scheme swap cannot fail for http/https bases
        let _ = url.set_scheme(if url.scheme() == "https" { "wss" } else { "ws" });
        url.to_string()
    }

    /// Exchanges the stored login for a bearer token. A rejected login is an
    /// Unauthorized, not a generic failure, so callers can route back to the
    /// login screen.
    async fn login(&self) -> Result<String, ClientError> {
        let login = match self.login.read().await.clone() {
            Some(login) => login,
            None => return Err(ClientError::Unauthorized),
        };

        let response = self
            .http_client
            .post(self.endpoint("/login"))
            .json(&login)
            .send()
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(ClientError::Unauthorized);
        }
        let response = error_for_status(response).await?;
        let body = response.text().await?;
        let info: TokenInfo = serde_json::from_str(&body)?;
        Ok(info.token)
    }

    async fn token(&self) -> Result<String, ClientError> {
        if let Some(token) = self.token.read().await.as_ref() {
            return Ok(token.clone());
        }
        let token = self.login().await?;
        self.token.write().await.replace(token.clone());
        Ok(token)
    }

    /// Sends `request` with a bearer token. On a 401 the cached token is
    /// dropped and the login is replayed once; a second 401 surfaces as
    /// Unauthorized instead of retrying forever.
    async fn send_authorized(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, ClientError> {
        let retry = request.try_clone();
        let token = self.token().await?;
        let response = request.bearer_auth(&token).send().await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return error_for_status(response).await;
        }

        self.token.write().await.take();
        let token = self.token().await?;
        let retry = retry.ok_or_else(|| {
            ClientError::Other("request with a streaming body cannot be retried".to_string())
        })?;
        let response = retry.bearer_auth(&token).send().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(ClientError::Unauthorized);
        }
        error_for_status(response).await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ClientError> {
        let request = self.http_client.get(self.endpoint(path)).query(query);
        let response = self.send_authorized(request).await?;
        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn get_bytes(&self, path: &str, query: &[(&str, &str)]) -> Result<Vec<u8>, ClientError> {
        let request = self.http_client.get(self.endpoint(path)).query(query);
        let response = self.send_authorized(request).await?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn post_json<B: Serialize>(&self, path: &str, body: &B) -> Result<(), ClientError> {
        let request = self.http_client.post(self.endpoint(path)).json(body);
        self.send_authorized(request).await?;
        Ok(())
    }

    async fn delete(&self, path: &str, query: &[(&str, &str)]) -> Result<(), ClientError> {
        let request = self.http_client.delete(self.endpoint(path)).query(query);
        self.send_authorized(request).await?;
        Ok(())
    }

    /// Cheap reachability + auth probe, used by connect before anything else.
    pub async fn api_test(&self) -> Result<(), ClientError> {
        let request = self.http_client.get(self.endpoint("/api"));
        self.send_authorized(request).await?;
        Ok(())
    }

    pub async fn sections(&self) -> Result<Vec<String>, ClientError> {
        self.get_json("/api/get/sections", &[]).await
    }

    pub async fn albums(&self) -> Result<Vec<String>, ClientError> {
        self.get_json("/api/get/albums", &[]).await
    }

    pub async fn songs(&self, section: &str) -> Result<Vec<Song>, ClientError> {
        self.get_json("/api/get/songs", &[("section", section)]).await
    }

    /// The full catalog in one call, section order as the server reports it.
    pub async fn sections_and_songs(&self) -> Result<IndexMap<String, Vec<Song>>, ClientError> {
        self.get_json("/api/get/sectionsAndSongs", &[]).await
    }

    pub async fn album_cover(&self, album: &str) -> Result<Vec<u8>, ClientError> {
        self.get_bytes("/api/get/albumCover", &[("album", album)]).await
    }

    /// Server-side last-modified of an album's cover, epoch milliseconds.
    pub async fn album_cover_modified(&self, album: &str) -> Result<i64, ClientError> {
        self.get_json("/api/get/albumCoverModificationDate", &[("album", album)])
            .await
    }

    /// Downloads a song's audio bytes. Songs are addressed by the full
    /// (section, name, album) triple; name alone is ambiguous across albums.
    pub async fn song_audio(
        &self,
        section: &str,
        name: &str,
        album: &str,
    ) -> Result<Vec<u8>, ClientError> {
        self.get_bytes(
            "/api/get/song",
            &[("section", section), ("name", name), ("album", album)],
        )
        .await
    }

    pub async fn create_section(&self, name: &str) -> Result<(), ClientError> {
        self.post_json("/api/post/section", &SectionWrapper { name: name.to_string() })
            .await
    }

    /// Creates an album with its cover. The server expects a multipart body:
    /// a `header` part carrying the album JSON and an `image` part with the
    /// PNG bytes.
    pub async fn create_album(&self, name: &str, image: Vec<u8>) -> Result<(), ClientError> {
        let header = serde_json::to_string(&SectionWrapper { name: name.to_string() })?;
        let image_part = multipart::Part::bytes(image)
            .file_name("cover.png")
            .mime_str("image/png")
            .map_err(|e| ClientError::Other(e.to_string()))?;
        let form = multipart::Form::new()
            .text("header", header)
            .part("image", image_part);

        let request = self
            .http_client
            .post(self.endpoint("/api/post/album"))
            .multipart(form);
        self.send_authorized(request).await?;
        Ok(())
    }

    pub async fn delete_section(&self, section: &str) -> Result<(), ClientError> {
        self.delete("/api/delete/section", &[("section", section)]).await
    }

    pub async fn delete_album(&self, album: &str) -> Result<(), ClientError> {
        self.delete("/api/delete/album", &[("album", album)]).await
    }

    pub async fn delete_song(
        &self,
        section: &str,
        name: &str,
        album: &str,
    ) -> Result<(), ClientError> {
        self.delete(
            "/api/delete/song",
            &[("section", section), ("name", name), ("album", album)],
        )
        .await
    }

    /// Submits a download request. The request tuple itself is the key the
    /// server reports status under; no separate id is minted.
    pub async fn submit_request(&self, request: &TaskRequest) -> Result<(), ClientError> {
        self.post_json("/api/post/request", request).await
    }

    pub async fn cancel_request(
        &self,
        name: &str,
        section: &str,
        album: &str,
    ) -> Result<(), ClientError> {
        self.post_json(
            "/api/post/cancelRequest",
            &CancelRequest {
                name: name.to_string(),
                section: section.to_string(),
                album: album.to_string(),
            },
        )
        .await
    }

    /// Drops the cached token; with `clear_login` also forgets the login data,
    /// after which nothing can re-authenticate until new credentials are set.
    pub async fn logout(&self, clear_login: bool) {
        if clear_login {
            self.login.write().await.take();
        }
        self.token.write().await.take();
    }
}

async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::Other(format!(
        "server returned {}: {}",
        status, body
    )))
}

/// TYPES ///
///
/// Wire types shared between the request/response API and the status channel.

#[derive(Debug, Deserialize)]
struct TokenInfo {
    token: String,
}

#[derive(Debug, Serialize)]
struct SectionWrapper {
    name: String,
}

#[derive(Debug, Serialize)]
struct CancelRequest {
    name: String,
    section: String,
    album: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Song {
    pub name: String,
    pub artist: String,
    pub album: String,
}

/// Identifying tuple of a requested download; the key of the status map.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TaskRequest {
    pub url: String,
    pub name: String,
    pub artist: String,
    pub album: String,
    pub section: String,
}

/// Life-cycle label of a download task as the server reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusKind {
    Queued,
    Fetching,
    Downloading,
    Converting,
    Normalizing,
    Enhancing,
    Finished,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusType {
    /// Long-running, no meaningful percentage.
    Indefinite,
    /// Bounded progress, percentage is 0.0..=1.0.
    Percentage,
    /// End state; the task never transitions again.
    Terminal,
}

impl StatusKind {
    pub fn status_type(self) -> StatusType {
        match self {
            StatusKind::Queued | StatusKind::Fetching | StatusKind::Enhancing => {
                StatusType::Indefinite
            }
            StatusKind::Downloading | StatusKind::Converting | StatusKind::Normalizing => {
                StatusType::Percentage
            }
            StatusKind::Finished | StatusKind::Error | StatusKind::Cancelled => StatusType::Terminal,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.status_type() == StatusType::Terminal
    }
}

/// One status frame from the channel. Missing fields decode to the same
/// defaults the server's serializer assumes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskStatus {
    #[serde(default)]
    pub request: TaskRequest,
    #[serde(default = "error_kind")]
    pub status: StatusKind,
    pub percentage: f64,
}

fn error_kind() -> StatusKind {
    StatusKind::Error
}

pub type StatusMap = HashMap<TaskRequest, TaskStatus>;
