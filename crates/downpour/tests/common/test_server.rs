//! Minimal HTTP/1.1 server for integration tests: HEAD preflight, Range
//! GETs, playlist serving, slow-drip bodies and injected failures.
//!
//! Serves a static set of resources from background threads. Each response
//! closes its connection, so every request shows up as its own entry in the
//! request log. The server runs until the test process exits.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// If false, HEAD returns 405 (simulates servers that block HEAD).
    pub head_allowed: bool,
    /// If false, GET ignores Range and always returns 200 with the full body.
    pub support_ranges: bool,
    /// If false, omit `Accept-Ranges: bytes` even if ranges work.
    pub advertise_ranges: bool,
    /// Write the body in `chunk_size` pieces with `delay` between them.
    pub throttle: Option<Throttle>,
    /// Respond 500 to the first N GET requests.
    pub fail_first_gets: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct Throttle {
    pub chunk_size: usize,
    pub delay: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            head_allowed: true,
            support_ranges: true,
            advertise_ranges: true,
            throttle: None,
            fail_first_gets: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Resource {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
}

impl Resource {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            content_type: None,
        }
    }

    pub fn with_content_type(body: Vec<u8>, content_type: &str) -> Self {
        Self {
            body,
            content_type: Some(content_type.to_string()),
        }
    }

    pub fn playlist(text: &str) -> Self {
        Self::with_content_type(text.as_bytes().to_vec(), "application/vnd.apple.mpegurl")
    }
}

#[derive(Debug, Clone)]
pub struct RequestLog {
    pub method: String,
    pub path: String,
    /// Parsed `Range: bytes=start-end` header (end is None for open ranges).
    pub range: Option<(u64, Option<u64>)>,
}

struct ServerState {
    resources: HashMap<String, Resource>,
    options: ServerOptions,
    log: Mutex<Vec<RequestLog>>,
    gets_served: AtomicUsize,
}

pub struct TestServer {
    pub base_url: String,
    state: Arc<ServerState>,
}

impl TestServer {
    /// Serve one resource at `/file.bin` with default options.
    pub fn single(body: Vec<u8>) -> (TestServer, String) {
        let server = Self::serve(vec![("/file.bin".to_string(), Resource::new(body))]);
        let url = server.url("/file.bin");
        (server, url)
    }

    pub fn serve(resources: Vec<(String, Resource)>) -> TestServer {
        Self::serve_with_options(resources, ServerOptions::default())
    }

    pub fn serve_with_options(
        resources: Vec<(String, Resource)>,
        options: ServerOptions,
    ) -> TestServer {
        super::init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server");
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(ServerState {
            resources: resources.into_iter().collect(),
            options,
            log: Mutex::new(Vec::new()),
            gets_served: AtomicUsize::new(0),
        });

        let accept_state = Arc::clone(&state);
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                let state = Arc::clone(&accept_state);
                thread::spawn(move || handle(stream, &state));
            }
        });

        TestServer {
            base_url: format!("http://127.0.0.1:{port}"),
            state,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    pub fn requests(&self) -> Vec<RequestLog> {
        self.state.log.lock().unwrap().clone()
    }

    /// GET requests observed for a given path.
    pub fn gets_for(&self, path: &str) -> Vec<RequestLog> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == "GET" && r.path == path)
            .collect()
    }
}

fn handle(mut stream: TcpStream, state: &ServerState) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let Some(request) = read_request(&mut stream) else {
        return;
    };
    let Some((method, path, range)) = parse_request(&request) else {
        return;
    };

    state.log.lock().unwrap().push(RequestLog {
        method: method.clone(),
        path: path.clone(),
        range,
    });

    let Some(resource) = state.resources.get(&path) else {
        let _ = stream.write_all(
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        );
        return;
    };
    let total = resource.body.len() as u64;
    let opts = &state.options;

    let mut extra_headers = String::new();
    // Advertising is independent of actual support so tests can cover
    // servers that advertise ranges and then ignore them.
    if opts.advertise_ranges {
        extra_headers.push_str("Accept-Ranges: bytes\r\n");
    }
    if let Some(ct) = &resource.content_type {
        extra_headers.push_str(&format!("Content-Type: {ct}\r\n"));
    }

    if method.eq_ignore_ascii_case("HEAD") {
        if !opts.head_allowed {
            let _ = stream.write_all(
                b"HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            );
            return;
        }
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {total}\r\n{extra_headers}Connection: close\r\n\r\n"
        );
        let _ = stream.write_all(response.as_bytes());
        return;
    }

    if !method.eq_ignore_ascii_case("GET") {
        let _ = stream.write_all(
            b"HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        );
        return;
    }

    let served = state.gets_served.fetch_add(1, Ordering::SeqCst);
    if served < opts.fail_first_gets {
        let _ = stream.write_all(
            b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        );
        return;
    }

    let (status, content_range, slice) = match range {
        Some((start, end)) if opts.support_ranges => {
            let start = start.min(total);
            let end_incl = end.unwrap_or(total.saturating_sub(1)).min(total.saturating_sub(1));
            if start > end_incl {
                let response = format!(
                    "HTTP/1.1 416 Range Not Satisfiable\r\nContent-Length: 0\r\nContent-Range: bytes */{total}\r\nConnection: close\r\n\r\n"
                );
                let _ = stream.write_all(response.as_bytes());
                return;
            }
            let slice = &resource.body[start as usize..=end_incl as usize];
            (
                "206 Partial Content",
                Some(format!("bytes {start}-{end_incl}/{total}")),
                slice,
            )
        }
        _ => ("200 OK", None, &resource.body[..]),
    };

    let mut response = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\n{extra_headers}",
        slice.len()
    );
    if let Some(content_range) = content_range {
        response.push_str(&format!("Content-Range: {content_range}\r\n"));
    }
    response.push_str("Connection: close\r\n\r\n");
    if stream.write_all(response.as_bytes()).is_err() {
        return;
    }

    match opts.throttle {
        Some(throttle) => {
            for chunk in slice.chunks(throttle.chunk_size.max(1)) {
                if stream.write_all(chunk).is_err() {
                    return;
                }
                let _ = stream.flush();
                thread::sleep(throttle.delay);
            }
        }
        None => {
            let _ = stream.write_all(slice);
        }
    }
}

fn read_request(stream: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];
    loop {
        let n = stream.read(&mut tmp).ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&tmp[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") || buf.len() > 64 * 1024 {
            break;
        }
    }
    String::from_utf8(buf).ok()
}

/// Returns (method, path, optional range) for the request head.
fn parse_request(request: &str) -> Option<(String, String, Option<(u64, Option<u64>)>)> {
    let mut lines = request.lines();
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let target = parts.next()?;
    let path = target.split('?').next().unwrap_or(target).to_string();

    let mut range = None;
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':')
            && name.trim().eq_ignore_ascii_case("range")
        {
            let value = value.trim();
            if let Some(spec) = value.strip_prefix("bytes=")
                && let Some((a, b)) = spec.split_once('-')
            {
                let start = a.trim().parse::<u64>().ok()?;
                let end = b.trim();
                let end = if end.is_empty() {
                    None
                } else {
                    Some(end.parse::<u64>().ok()?)
                };
                range = Some((start, end));
            }
        }
    }
    Some((method, path, range))
}
