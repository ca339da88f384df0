//! IPFS Kubo RPC client.
//!
//! Adds go through `POST /api/v0/add?pin=true` as `multipart/form-data`.
//! Directories are sent as an `application/x-directory` part for every
//! directory followed by its files, with slash-separated file names relative
//! to the directory's parent; Kubo answers with one JSON object per line and
//! the entry named after the root directory carries the root identifier.

use super::{ContentNetwork, NetworkError};
use crate::storage::ObjectReader;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::io::ReaderStream;
use url::Url;

const DIRECTORY_MIME: &str = "application/x-directory";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AddEntry {
    name: String,
    hash: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiErrorBody {
    message: String,
}

/// Client for one Kubo node.
#[derive(Debug, Clone)]
pub struct IpfsClient {
    http: Client,
    base: Url,
}

impl IpfsClient {
    /// Creates a client for the RPC API at `api_url` (e.g. `http://127.0.0.1:5001`).
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Config`] for an invalid URL and
    /// [`NetworkError::Http`] if the HTTP client cannot be built.
    pub fn new(api_url: &str, timeout: Duration) -> Result<Self, NetworkError> {
        let base = Url::parse(api_url)
            .map_err(|e| NetworkError::Config(format!("invalid api url '{api_url}': {e}")))?;
        if base.cannot_be_a_base() {
            return Err(NetworkError::Config(format!("api url '{api_url}' cannot be a base")));
        }
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { http, base })
    }

    /// Creates a client for the local node, reading its API address from
    /// `$IPFS_PATH/api` (default `~/.ipfs/api`).
    ///
    /// # Errors
    ///
    /// Returns an error if the repo path cannot be determined, the api file
    /// cannot be read, or it does not hold a supported multiaddr.
    pub fn local(timeout: Duration) -> Result<Self, NetworkError> {
        let repo = match std::env::var_os("IPFS_PATH") {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => dirs::home_dir()
                .ok_or_else(|| NetworkError::Config("cannot determine home directory".into()))?
                .join(".ipfs"),
        };
        let api_file = repo.join("api");
        let multiaddr = std::fs::read_to_string(&api_file)?;
        let url = multiaddr_to_url(multiaddr.trim())?;
        tracing::debug!(api_file = %api_file.display(), %url, "using local IPFS node");
        Self::new(&url, timeout)
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str, query: &[(&str, &str)]) -> Result<Url, NetworkError> {
        let mut url = self
            .base
            .join(path)
            .map_err(|e| NetworkError::Config(format!("cannot build url for {path}: {e}")))?;
        url.query_pairs_mut().extend_pairs(query);
        Ok(url)
    }

    /// Sends a request and turns non-success statuses into [`NetworkError::Api`].
    async fn call(&self, url: Url, form: Option<Form>) -> Result<String, NetworkError> {
        let mut request = self.http.post(url);
        if let Some(form) = form {
            request = request.multipart(form);
        }
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if status.is_success() {
            return Ok(body);
        }
        let message = serde_json::from_str::<ApiErrorBody>(&body)
            .map(|e| e.message)
            .unwrap_or_else(|_| body.trim().to_string());
        Err(NetworkError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn add(&self, form: Form, root: &str) -> Result<String, NetworkError> {
        let url = self.endpoint("api/v0/add", &[("pin", "true"), ("progress", "false")])?;
        let body = self.call(url, Some(form)).await?;
        root_hash(&body, root)
    }
}

/// Picks the identifier of `root` from an NDJSON add response.
///
/// Falls back to the last entry, which Kubo always emits for the root.
fn root_hash(body: &str, root: &str) -> Result<String, NetworkError> {
    let mut last = None;
    for line in body.lines().filter(|l| !l.trim().is_empty()) {
        let entry: AddEntry = serde_json::from_str(line)
            .map_err(|e| NetworkError::InvalidResponse(format!("{e}: {line}")))?;
        if entry.name == root {
            return Ok(entry.hash);
        }
        last = Some(entry.hash);
    }
    last.ok_or_else(|| NetworkError::InvalidResponse("empty add response".into()))
}

/// Converts a Kubo API multiaddr (`/ip4/127.0.0.1/tcp/5001`) into an HTTP URL.
///
/// Supports `ip4`, `ip6`, `dns`, `dns4` and `dns6` hosts over `tcp`, with an
/// optional trailing `/http` or `/https`.
///
/// # Errors
///
/// Returns [`NetworkError::Config`] for any other shape.
pub fn multiaddr_to_url(multiaddr: &str) -> Result<String, NetworkError> {
    let unsupported = || NetworkError::Config(format!("unsupported API multiaddr '{multiaddr}'"));
    let parts: Vec<&str> = multiaddr.trim_start_matches('/').split('/').collect();
    let (proto, host, port, scheme) = match parts.as_slice() {
        [proto, host, "tcp", port] => (*proto, *host, *port, "http"),
        [proto, host, "tcp", port, scheme @ ("http" | "https")] => (*proto, *host, *port, *scheme),
        _ => return Err(unsupported()),
    };
    port.parse::<u16>().map_err(|_| unsupported())?;
    let host = match proto {
        "ip4" | "dns" | "dns4" | "dns6" => host.to_string(),
        "ip6" => format!("[{host}]"),
        _ => return Err(unsupported()),
    };
    Ok(format!("{scheme}://{host}:{port}"))
}

/// Entry of a directory walk, relative to the walked directory.
#[derive(Debug)]
enum Entry {
    Dir(String),
    File { relative: String, path: PathBuf, len: u64 },
}

/// Lists a directory tree depth first, parents before children, sorted by name.
fn walk(root: &Path) -> std::io::Result<Vec<Entry>> {
    fn visit(dir: &Path, prefix: &str, out: &mut Vec<Entry>) -> std::io::Result<()> {
        let mut children: Vec<_> = std::fs::read_dir(dir)?.collect::<Result<_, _>>()?;
        children.sort_by_key(std::fs::DirEntry::file_name);
        for child in children {
            let name = child.file_name().to_string_lossy().into_owned();
            let relative = format!("{prefix}/{name}");
            let file_type = child.file_type()?;
            if file_type.is_dir() {
                out.push(Entry::Dir(relative.clone()));
                visit(&child.path(), &relative, out)?;
            } else if file_type.is_file() {
                out.push(Entry::File {
                    relative,
                    path: child.path(),
                    len: child.metadata()?.len(),
                });
            }
        }
        Ok(())
    }

    let mut out = Vec::new();
    visit(root, "", &mut out)?;
    Ok(out)
}

fn directory_part(name: String) -> Result<Part, NetworkError> {
    Ok(Part::bytes(Vec::new()).file_name(name).mime_str(DIRECTORY_MIME)?)
}

#[async_trait]
impl ContentNetwork for IpfsClient {
    async fn add_stream(&self, name: &str, reader: ObjectReader) -> Result<String, NetworkError> {
        let body = Body::wrap_stream(ReaderStream::new(reader));
        let part = Part::stream(body)
            .file_name(name.to_string())
            .mime_str("application/octet-stream")?;
        let form = Form::new().percent_encode_path_segment().part("file", part);
        self.add(form, name).await
    }

    async fn add_dir(&self, path: &Path) -> Result<String, NetworkError> {
        let root = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| NetworkError::Config(format!("'{}' has no name", path.display())))?;
        let walked = {
            let path = path.to_path_buf();
            tokio::task::spawn_blocking(move || walk(&path))
                .await
                .map_err(|e| NetworkError::Io(std::io::Error::other(e)))??
        };

        let mut form = Form::new()
            .percent_encode_path_segment()
            .part("file", directory_part(root.clone())?);
        for entry in walked {
            let part = match entry {
                Entry::Dir(relative) => directory_part(format!("{root}{relative}"))?,
                Entry::File {
                    relative,
                    path,
                    len,
                } => {
                    let file = tokio::fs::File::open(&path).await?;
                    Part::stream_with_length(Body::wrap_stream(ReaderStream::new(file)), len)
                        .file_name(format!("{root}{relative}"))
                        .mime_str("application/octet-stream")?
                },
            };
            form = form.part("file", part);
        }

        self.add(form, &root).await
    }

    async fn unpin(&self, content_id: &str) -> Result<(), NetworkError> {
        let url = self.endpoint(
            "api/v0/pin/rm",
            &[("arg", content_id), ("recursive", "true")],
        )?;
        self.call(url, None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multiaddr_to_url() {
        assert_eq!(
            multiaddr_to_url("/ip4/127.0.0.1/tcp/5001").unwrap(),
            "http://127.0.0.1:5001"
        );
        assert_eq!(
            multiaddr_to_url("/ip6/::1/tcp/5001").unwrap(),
            "http://[::1]:5001"
        );
        assert_eq!(
            multiaddr_to_url("/dns4/ipfs.local/tcp/443/https").unwrap(),
            "https://ipfs.local:443"
        );
        assert!(multiaddr_to_url("/ip4/127.0.0.1/udp/5001").is_err());
        assert!(multiaddr_to_url("/unix/tmp/ipfs.sock").is_err());
        assert!(multiaddr_to_url("/ip4/127.0.0.1/tcp/notaport").is_err());
    }

    #[test]
    fn test_root_hash_prefers_named_root() {
        let body = concat!(
            "{\"Name\":\"scratch/docs/a.txt\",\"Hash\":\"QmFile\",\"Size\":\"12\"}\n",
            "{\"Name\":\"scratch/docs\",\"Hash\":\"QmDocs\",\"Size\":\"60\"}\n",
            "{\"Name\":\"scratch\",\"Hash\":\"QmRoot\",\"Size\":\"120\"}\n",
        );
        assert_eq!(root_hash(body, "scratch").unwrap(), "QmRoot");
        assert_eq!(root_hash(body, "other").unwrap(), "QmRoot");
        assert!(root_hash("", "x").is_err());
        assert!(root_hash("not json", "x").is_err());
    }

    #[test]
    fn test_walk_orders_parents_first() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("docs/sub")).unwrap();
        std::fs::write(temp.path().join("docs/sub/b.txt"), "b").unwrap();
        std::fs::write(temp.path().join("docs/a.txt"), "a").unwrap();
        std::fs::write(temp.path().join("z.txt"), "z").unwrap();

        let names: Vec<String> = walk(temp.path())
            .unwrap()
            .into_iter()
            .map(|e| match e {
                Entry::Dir(r) => format!("{r}/"),
                Entry::File { relative, .. } => relative,
            })
            .collect();
        assert_eq!(
            names,
            vec!["/docs/", "/docs/a.txt", "/docs/sub/", "/docs/sub/b.txt", "/z.txt"]
        );
    }

    #[test]
    fn test_endpoint_keeps_base_path() {
        let client = IpfsClient::new("http://127.0.0.1:5001/", Duration::from_secs(1)).unwrap();
        let url = client
            .endpoint("api/v0/pin/rm", &[("arg", "QmX"), ("recursive", "true")])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:5001/api/v0/pin/rm?arg=QmX&recursive=true"
        );
        assert!(IpfsClient::new("not a url", Duration::from_secs(1)).is_err());
    }
}
