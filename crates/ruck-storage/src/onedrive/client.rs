use std::io::Read;
use std::time::Duration;

use serde::Deserialize;

use ruck_types::{Result, RuckError};

use super::auth::TokenSource;

/// Graph API root for the signed-in user's drive.
pub const GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0/me/drive/root";

/// Upload-session fragment size: 30 × 320 KiB, the OneDrive-recommended
/// multiple. Fragments that are not a multiple of 320 KiB (except the last)
/// are rejected by the service.
pub const UPLOAD_FRAGMENT_SIZE: u64 = 327_680 * 30;

/// A drive item as returned by item-info and children listings.
#[derive(Debug, Deserialize)]
pub(crate) struct DriveItem {
    pub name: String,
    #[serde(default)]
    pub size: u64,
}

/// One page of a children listing, with the cursor to the next page.
#[derive(Debug, Deserialize)]
pub(crate) struct ChildrenPage {
    #[serde(rename = "@odata.nextLink")]
    pub next_link: Option<String>,
    #[serde(rename = "value")]
    pub children: Vec<DriveItem>,
}

#[derive(Debug, Deserialize)]
struct UploadSession {
    #[serde(rename = "uploadUrl")]
    upload_url: String,
}

/// Split an upload of `total` bytes into `(pos, len)` fragment spans.
pub(crate) fn fragment_spans(total: u64) -> Vec<(u64, u64)> {
    let mut spans = Vec::new();
    let mut pos = 0;
    while pos < total {
        let len = UPLOAD_FRAGMENT_SIZE.min(total - pos);
        spans.push((pos, len));
        pos += len;
    }
    spans
}

/// Map a ureq error to the error taxonomy: 404 becomes `NotExist` for the
/// probed path, other non-2xx statuses become `Transport`, connection-level
/// failures become `Io` (retryable by an outer wrapper).
fn map_err(path: &str, err: ureq::Error) -> RuckError {
    match err {
        ureq::Error::Status(404, _) => RuckError::NotExist(path.to_string()),
        ureq::Error::Status(code, resp) => RuckError::http(code, resp.status_text().to_string()),
        ureq::Error::Transport(t) => {
            RuckError::Io(std::io::Error::new(std::io::ErrorKind::Other, t.to_string()))
        }
    }
}

/// Low-level OneDrive Graph API calls. One instance per backend; all calls
/// are blocking and carry no retry logic of their own.
pub(crate) struct GraphClient {
    /// Agent for Graph endpoints; `Authorization` is attached per request.
    agent: ureq::Agent,
    /// Agent for fragment PUTs: the session `uploadUrl` is pre-authorized
    /// and must not receive an `Authorization` header.
    plain: ureq::Agent,
    auth: TokenSource,
    base_url: String,
}

impl GraphClient {
    pub(crate) fn new(auth: TokenSource, base_url: Option<&str>) -> Self {
        let build = || {
            ureq::AgentBuilder::new()
                .timeout_connect(Duration::from_secs(30))
                .timeout_read(Duration::from_secs(300))
                .timeout_write(Duration::from_secs(300))
                .build()
        };
        GraphClient {
            agent: build(),
            plain: build(),
            auth,
            base_url: base_url.unwrap_or(GRAPH_BASE_URL).to_string(),
        }
    }

    fn item_url(&self, path: &str, suffix: &str) -> String {
        format!("{}:/{}{}", self.base_url, path, suffix)
    }

    fn authorized(&self, req: ureq::Request) -> Result<ureq::Request> {
        let token = self.auth.bearer()?;
        Ok(req.set("Authorization", &format!("Bearer {token}")))
    }

    /// Metadata of an item; `NotExist` if absent.
    pub(crate) fn item_info(&self, path: &str) -> Result<DriveItem> {
        let url = self.item_url(path, "");
        let resp = self
            .authorized(self.agent.get(&url))?
            .call()
            .map_err(|e| map_err(path, e))?;
        let item: DriveItem = resp.into_json()?;
        Ok(item)
    }

    /// URL of the first children page for `path`.
    pub(crate) fn children_url(&self, path: &str) -> String {
        self.item_url(path, ":/children?select=name")
    }

    /// Fetch one children page (first page or a follow-up `@odata.nextLink`).
    pub(crate) fn children_page(&self, url: &str) -> Result<(Vec<String>, Option<String>)> {
        let resp = self
            .authorized(self.agent.get(url))?
            .call()
            .map_err(|e| map_err(url, e))?;
        let page: ChildrenPage = resp.into_json()?;
        let names = page.children.into_iter().map(|c| c.name).collect();
        Ok((names, page.next_link))
    }

    /// Delete an item (file or folder, recursively).
    pub(crate) fn delete_item(&self, path: &str) -> Result<()> {
        let url = self.item_url(path, "");
        self.authorized(self.agent.delete(&url))?
            .call()
            .map_err(|e| map_err(path, e))?;
        Ok(())
    }

    /// Create a folder if it does not already exist. A 412 response means
    /// another writer created it first and counts as success.
    pub(crate) fn create_folder(&self, path: &str) -> Result<()> {
        let (url, name) = match path.rfind('/') {
            Some(idx) => (
                self.item_url(&path[..idx], ":/children"),
                &path[idx + 1..],
            ),
            None => (format!("{}/children", self.base_url), path),
        };

        let body = serde_json::json!({ "name": name, "folder": {} });
        let result = self
            .authorized(self.agent.post(&url))?
            .set("Content-Type", "application/json")
            .set("If-None-Match", "*")
            .send_json(body);
        match result {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(412, _)) => Ok(()),
            Err(e) => Err(map_err(path, e)),
        }
    }

    /// Open an upload session for `path`. With `protect`, the session carries
    /// `If-None-Match: *` so an existing item fails the create with 412.
    pub(crate) fn create_upload_session(&self, path: &str, protect: bool) -> Result<String> {
        let url = self.item_url(path, ":/createUploadSession");
        let mut req = self
            .authorized(self.agent.post(&url))?
            .set("Content-Type", "application/octet-stream");
        if protect {
            req = req.set("If-None-Match", "*");
        }
        let resp = req.call().map_err(|e| match e {
            // An existing item is a precondition failure, not absence.
            ureq::Error::Status(code, resp) => {
                RuckError::http(code, resp.status_text().to_string())
            }
            other => map_err(path, other),
        })?;
        let session: UploadSession = resp.into_json()?;
        Ok(session.upload_url)
    }

    /// PUT one fragment to a session `uploadUrl`. The session URL is
    /// pre-authorized; no `Authorization` header is sent.
    pub(crate) fn upload_fragment(
        &self,
        upload_url: &str,
        fragment: &[u8],
        pos: u64,
        total: u64,
    ) -> Result<()> {
        let end = pos + fragment.len() as u64 - 1;
        let result = self
            .plain
            .put(upload_url)
            .set("Content-Type", "application/octet-stream")
            .set("Content-Range", &format!("bytes {pos}-{end}/{total}"))
            .send_bytes(fragment);
        match result {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(code, resp)) => {
                // Surface the service's message verbatim; the intermittent
                // 400 "Declared fragment length does not match…" is absorbed
                // by an outer retry wrapper, not here.
                let phrase = resp
                    .into_string()
                    .ok()
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| "fragment upload failed".into());
                Err(RuckError::http(code, phrase))
            }
            Err(e) => Err(map_err(upload_url, e)),
        }
    }

    /// Ranged content read. Servers answer 200 or 206; both are honored.
    pub(crate) fn get_content(
        &self,
        path: &str,
        length: u32,
        offset: u64,
    ) -> Result<Box<dyn Read + Send>> {
        let url = self.item_url(path, ":/content");
        let mut req = self.authorized(self.agent.get(&url))?;
        if length > 0 || offset > 0 {
            let range = if length > 0 {
                format!("bytes={offset}-{}", offset + length as u64 - 1)
            } else {
                format!("bytes={offset}-")
            };
            req = req.set("Range", &range);
        }
        let resp = req.call().map_err(|e| map_err(path, e))?;
        Ok(Box::new(resp.into_reader()))
    }
}
