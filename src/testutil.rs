/* --------------------------
Test-only helpers
    - A tiny in-process HTTP server: routes are "METHOD /path" keys mapped to
      scriptable responders, with per-route hit counts and captured bodies.
      Every response closes its connection, so each request is independent.
    - wait_until() polls a condition instead of sleeping a fixed amount.
-------------------------- */

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Maps the per-route hit index (0-based) to (status, content type, body).
pub type Responder = Arc<dyn Fn(usize) -> (u16, String, Vec<u8>) + Send + Sync>;

pub fn fixed(status: u16, content_type: &str, body: Vec<u8>) -> Responder {
    let content_type = content_type.to_string();
    Arc::new(move |_| (status, content_type.clone(), body.clone()))
}

pub fn json(body: &str) -> Responder {
    fixed(200, "application/json", body.as_bytes().to_vec())
}

/// Replays the scripted responses in order, repeating the last one.
pub fn sequence(responses: Vec<(u16, &'static str, Vec<u8>)>) -> Responder {
    Arc::new(move |hit| {
        let (status, content_type, body) = &responses[hit.min(responses.len() - 1)];
        (*status, content_type.to_string(), body.clone())
    })
}

pub struct MockHttp {
    pub port: u16,
    hits: Arc<Mutex<HashMap<String, usize>>>,
    bodies: Arc<Mutex<HashMap<String, Vec<Vec<u8>>>>>,
}

impl MockHttp {
    pub fn hits(&self, route: &str) -> usize {
        *self.hits.lock().unwrap().get(route).unwrap_or(&0)
    }

    pub fn bodies(&self, route: &str) -> Vec<Vec<u8>> {
        self.bodies
            .lock()
            .unwrap()
            .get(route)
            .cloned()
            .unwrap_or_default()
    }
}

/// Starts the server on an ephemeral port. A default "POST /login" route
/// answering `{"token":"test-token"}` is added unless the caller overrides it.
pub async fn serve(mut routes: HashMap<String, Responder>) -> MockHttp {
    routes
        .entry("POST /login".to_string())
        .or_insert_with(|| json(r#"{"token":"test-token"}"#));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let hits: Arc<Mutex<HashMap<String, usize>>> = Arc::new(Mutex::new(HashMap::new()));
    let bodies: Arc<Mutex<HashMap<String, Vec<Vec<u8>>>>> = Arc::new(Mutex::new(HashMap::new()));

    let routes = Arc::new(routes);
    let accept_hits = hits.clone();
    let accept_bodies = bodies.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let routes = routes.clone();
            let hits = accept_hits.clone();
            let bodies = accept_bodies.clone();
            tokio::spawn(async move {
                let _ = handle_connection(stream, routes, hits, bodies).await;
            });
        }
    });

    MockHttp { port, hits, bodies }
}

async fn handle_connection(
    mut stream: TcpStream,
    routes: Arc<HashMap<String, Responder>>,
    hits: Arc<Mutex<HashMap<String, usize>>>,
    bodies: Arc<Mutex<HashMap<String, Vec<Vec<u8>>>>>,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let target = parts.next().unwrap_or_default();
    let path = target.split('?').next().unwrap_or_default();

    let content_length = lines
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.eq_ignore_ascii_case("content-length") {
                value.trim().parse::<usize>().ok()
            } else {
                None
            }
        })
        .next()
        .unwrap_or(0);

    let mut body = buf[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }

    let key = format!("{} {}", method, path);
    let hit = {
        let mut hits = hits.lock().unwrap();
        let entry = hits.entry(key.clone()).or_insert(0);
        let current = *entry;
        *entry += 1;
        current
    };
    bodies.lock().unwrap().entry(key.clone()).or_default().push(body);

    let (status, content_type, payload) = match routes.get(&key) {
        Some(responder) => responder(hit),
        None => (404, "text/plain".to_string(), b"not found".to_vec()),
    };

    let reason = if status < 400 { "OK" } else { "ERR" };
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        reason,
        content_type,
        payload.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.write_all(&payload).await?;
    stream.shutdown().await?;
    Ok(())
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Polls `predicate` every 10ms, panicking if it does not hold within 5s.
pub async fn wait_until(mut predicate: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !predicate() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached within 5s");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
