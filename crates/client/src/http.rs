//! Monoio-native HTTP/1.1 client
//!
//! Just enough HTTP for the subscription endpoints: one request per
//! connection (`Connection: close`), JSON bodies, bearer headers, and
//! `Content-Length` framed responses.

use crate::errors::{Result, StreamError};
use crate::transport::{MaybeTlsStream, default_tls_config};

use rustls::ClientConfig;
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// HTTP response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpResponse {
    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Whether the status is 2xx
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Monoio-native HTTP/HTTPS client
#[derive(Clone)]
pub struct MonoioHttpClient {
    tls_config: Arc<ClientConfig>,
    user_agent: String,
}

impl MonoioHttpClient {
    /// Create a new client with the default TLS configuration
    pub fn new() -> Self {
        Self {
            tls_config: default_tls_config(),
            user_agent: "streamwire/0.1".to_string(),
        }
    }

    /// POST a JSON body
    pub async fn post_json(
        &self,
        url: &str,
        body: &str,
        headers: &[(&str, &str)],
    ) -> Result<HttpResponse> {
        let mut all_headers = vec![("Content-Type", "application/json")];
        all_headers.extend_from_slice(headers);
        self.request("POST", url, Some(body), &all_headers).await
    }

    /// DELETE a resource
    pub async fn delete(&self, url: &str, headers: &[(&str, &str)]) -> Result<HttpResponse> {
        self.request("DELETE", url, None, headers).await
    }

    /// Issue a request and read the full response
    pub async fn request(
        &self,
        method: &str,
        url: &str,
        body: Option<&str>,
        headers: &[(&str, &str)],
    ) -> Result<HttpResponse> {
        let parsed_url = Url::parse(url)?;
        let host = parsed_url
            .host_str()
            .ok_or_else(|| StreamError::InvalidUrl("No host in URL".to_string()))?;
        let host_header = match parsed_url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        let mut path_and_query = parsed_url.path().to_string();
        if path_and_query.is_empty() {
            path_and_query.push('/');
        }
        if let Some(query) = parsed_url.query() {
            path_and_query.push('?');
            path_and_query.push_str(query);
        }

        let mut stream = MaybeTlsStream::connect(&parsed_url, &self.tls_config).await?;

        let content_length = body.map(str::len).unwrap_or(0);
        let mut request = format!(
            "{method} {path_and_query} HTTP/1.1\r\n\
             Host: {host_header}\r\n\
             User-Agent: {}\r\n\
             Accept: application/json\r\n\
             Connection: close\r\n\
             Content-Length: {content_length}\r\n",
            self.user_agent
        );
        for (key, value) in headers {
            request.push_str(&format!("{key}: {value}\r\n"));
        }
        request.push_str("\r\n");
        if let Some(body) = body {
            request.push_str(body);
        }

        debug!("HTTP {} {}", method, url);
        stream.write_all(request.as_bytes()).await?;

        let raw = read_response(&mut stream).await?;
        parse_http_response(&raw)
    }
}

impl Default for MonoioHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Read until the declared body length has arrived, or EOF without one
async fn read_response(stream: &mut MaybeTlsStream) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(4096);
    let mut chunk = vec![0u8; 8192];

    loop {
        if let Some(header_end) = find_header_end(&data) {
            let head = String::from_utf8_lossy(&data[..header_end]);
            if let Some(length) = content_length(&head) {
                if data.len() >= header_end + 4 + length {
                    data.truncate(header_end + 4 + length);
                    return Ok(data);
                }
            }
        }

        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(data);
        }
        data.extend_from_slice(&chunk[..n]);
    }
}

fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|window| window == b"\r\n\r\n")
}

fn content_length(head: &str) -> Option<usize> {
    head.lines().skip(1).find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

/// Parse a raw HTTP/1.1 response
pub fn parse_http_response(data: &[u8]) -> Result<HttpResponse> {
    let header_end = find_header_end(data).ok_or_else(|| {
        StreamError::InvalidResponse("Invalid HTTP response: no header terminator".to_string())
    })?;

    let head = String::from_utf8_lossy(&data[..header_end]);
    let body = String::from_utf8_lossy(&data[header_end + 4..]).into_owned();

    let mut lines = head.lines();
    let status_line = lines
        .next()
        .ok_or_else(|| StreamError::InvalidResponse("Empty response".to_string()))?;
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| StreamError::InvalidResponse(format!("Invalid status line: {status_line}")))?;

    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect();

    Ok(HttpResponse {
        status,
        headers,
        body,
    })
}
