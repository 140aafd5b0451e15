//! Authenticated session client for one qBittorrent instance
//!
//! Holds the SID cookie obtained from `/api/v2/auth/login` and replays it on
//! every call. A 403 from the remote invalidates the session, triggers one
//! re-login, and replays the original call once; a second failure surfaces
//! to the caller unchanged.

use std::future::Future;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::header::{COOKIE, ORIGIN, REFERER, SET_COOKIE};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use super::error::QbError;
use super::models::{Categories, TorrentContent, TorrentInfo, TrackerEntry, TransferInfo};
use super::version::{self, ContentLayoutParam};

/// Options accepted by [`QbClient::add_torrent`].
///
/// Mirrors the multipart form of `/api/v2/torrents/add`; version-gated
/// parameters (`tags`, `contentLayout`) are shaped at send time.
#[derive(Debug, Default, Clone)]
pub struct AddTorrentOptions {
    /// Newline-separated magnet links / torrent URLs.
    pub urls: Option<String>,
    /// Uploaded .torrent payloads as (filename, bytes).
    pub torrents: Vec<(String, Vec<u8>)>,
    pub savepath: Option<String>,
    pub category: Option<String>,
    /// Comma-joined tags; only sent to remotes that support it (4.2.0+).
    pub tags: Option<String>,
    pub paused: bool,
    /// "Original", "Subfolder" or "NoSubfolder".
    pub content_layout: Option<String>,
    pub ratio_limit: Option<String>,
    pub seeding_time_limit: Option<String>,
    pub up_limit: Option<String>,
    pub dl_limit: Option<String>,
}

/// The live-list fetch the sync engine depends on, kept as a seam so the
/// engine can be exercised against a scripted fake.
#[async_trait]
pub trait TorrentLister: Send + Sync {
    async fn list_torrents(&self) -> Result<Vec<TorrentInfo>, QbError>;
}

/// One authenticated session to one remote qBittorrent instance.
pub struct QbClient {
    http: Client,
    base_url: String,
    username: String,
    password: String,
    /// First Set-Cookie pair from login, usually `SID=...`. None means
    /// unauthenticated; the next operation logs in implicitly.
    session: RwLock<Option<String>>,
    app_version: RwLock<Option<String>>,
    api_version: RwLock<Option<String>>,
}

impl QbClient {
    pub fn new(host: &str, port: u16, username: &str, password: &str) -> Self {
        Self {
            http: Client::new(),
            base_url: format!("http://{host}:{port}"),
            username: username.to_string(),
            password: password.to_string(),
            session: RwLock::new(None),
            app_version: RwLock::new(None),
            api_version: RwLock::new(None),
        }
    }

    /// Exchanges the configured credentials for a session cookie.
    ///
    /// qBittorrent answers 200 with body "Fails." on bad credentials and
    /// only sets the SID cookie on success, so the cookie is the source of
    /// truth here, not the status code.
    pub async fn login(&self) -> Result<(), QbError> {
        debug!(base_url = %self.base_url, "logging in");
        let resp = self
            .http
            .post(format!("{}/api/v2/auth/login", self.base_url))
            .header(REFERER, &self.base_url)
            .header(ORIGIN, &self.base_url)
            .form(&[
                ("username", self.username.as_str()),
                ("password", self.password.as_str()),
            ])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(QbError::Auth(format!("login returned {status}: {body}")));
        }

        let cookie = resp
            .headers()
            .get(SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(|v| v.trim().to_string());

        let body = resp.text().await.unwrap_or_default();
        match cookie {
            Some(cookie) if !cookie.is_empty() => {
                *self.session.write() = Some(cookie);
            }
            _ => {
                return Err(QbError::Auth(if body.trim() == "Ok." {
                    "login succeeded but no session cookie was returned".to_string()
                } else {
                    "credentials rejected".to_string()
                }));
            }
        }

        self.fetch_versions().await;
        Ok(())
    }

    /// Probes the remote's application and Web API versions. Best-effort: a
    /// failure leaves the version unknown and request shaping optimistic.
    async fn fetch_versions(&self) {
        match self.fetch_text("/api/v2/app/version").await {
            Ok(v) => *self.app_version.write() = Some(v.trim().to_string()),
            Err(e) => warn!(base_url = %self.base_url, error = %e, "failed to fetch app version"),
        }
        match self.fetch_text("/api/v2/app/webapiVersion").await {
            Ok(v) => *self.api_version.write() = Some(v.trim().to_string()),
            Err(e) => warn!(base_url = %self.base_url, error = %e, "failed to fetch api version"),
        }
        debug!(
            base_url = %self.base_url,
            app_version = ?self.app_version.read(),
            api_version = ?self.api_version.read(),
            "connected"
        );
    }

    async fn fetch_text(&self, path: &str) -> Result<String, QbError> {
        let cookie = self.session.read().clone().unwrap_or_default();
        let resp = self
            .http
            .get(format!("{}{path}", self.base_url))
            .header(COOKIE, cookie)
            .send()
            .await?;
        Ok(ensure_ok(resp).await?.text().await?)
    }

    pub fn app_version(&self) -> Option<String> {
        self.app_version.read().clone()
    }

    pub fn api_version(&self) -> Option<String> {
        self.api_version.read().clone()
    }

    /// Runs `op` under the session contract: implicit login when
    /// unauthenticated, then at most one re-login + replay on expiry.
    async fn with_session<T, F, Fut>(&self, op: F) -> Result<T, QbError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, QbError>>,
    {
        if self.session.read().is_none() {
            self.login().await?;
        }
        with_relogin(
            || op(self.session.read().clone().unwrap_or_default()),
            || async {
                *self.session.write() = None;
                self.login().await
            },
        )
        .await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, QbError> {
        self.with_session(|cookie| {
            let req = self
                .http
                .get(format!("{}{path}", self.base_url))
                .query(query)
                .header(COOKIE, cookie);
            async move {
                let resp = ensure_ok(req.send().await?).await?;
                Ok(resp.json().await?)
            }
        })
        .await
    }

    async fn post_form(&self, path: &str, form: &[(&str, String)]) -> Result<(), QbError> {
        self.with_session(|cookie| {
            let req = self
                .http
                .post(format!("{}{path}", self.base_url))
                .header(COOKIE, cookie)
                .header(REFERER, &self.base_url)
                .header(ORIGIN, &self.base_url)
                .form(form);
            async move {
                ensure_ok(req.send().await?).await?;
                Ok(())
            }
        })
        .await
    }

    /// Full live torrent list; the remote returns the complete set in one
    /// call, no pagination.
    pub async fn list_torrents(&self) -> Result<Vec<TorrentInfo>, QbError> {
        self.get_json("/api/v2/torrents/info", &[]).await
    }

    pub async fn transfer_info(&self) -> Result<TransferInfo, QbError> {
        self.get_json("/api/v2/transfer/info", &[]).await
    }

    /// Generic bulk operation (`start`, `stop`, `reannounce`, `recheck`,
    /// `setCategory`, `addTags`, ...) addressed by pipe-joined hashes.
    pub async fn perform_action(
        &self,
        action: &str,
        hashes: &str,
        extra: &[(&str, String)],
    ) -> Result<(), QbError> {
        debug!(action, hashes, "performing action");
        let mut form: Vec<(&str, String)> = vec![("hashes", hashes.to_string())];
        form.extend(extra.iter().cloned());
        self.post_form(&format!("/api/v2/torrents/{action}"), &form)
            .await
    }

    pub async fn delete_torrents(&self, hashes: &str, delete_files: bool) -> Result<(), QbError> {
        self.post_form(
            "/api/v2/torrents/delete",
            &[
                ("hashes", hashes.to_string()),
                ("deleteFiles", delete_files.to_string()),
            ],
        )
        .await
    }

    pub async fn add_torrent(&self, options: &AddTorrentOptions) -> Result<(), QbError> {
        self.with_session(|cookie| {
            let req = self
                .http
                .post(format!("{}/api/v2/torrents/add", self.base_url))
                .header(COOKIE, cookie)
                .header(REFERER, &self.base_url)
                .header(ORIGIN, &self.base_url)
                .multipart(self.build_add_form(options));
            async move {
                ensure_ok(req.send().await?).await?;
                Ok(())
            }
        })
        .await
    }

    fn build_add_form(&self, options: &AddTorrentOptions) -> reqwest::multipart::Form {
        use reqwest::multipart::{Form, Part};

        let reported = self.app_version.read().clone();
        let mut form = Form::new();
        if let Some(urls) = &options.urls {
            form = form.text("urls", urls.clone());
        }
        for (filename, bytes) in &options.torrents {
            form = form.part(
                "torrents",
                Part::bytes(bytes.clone()).file_name(filename.clone()),
            );
        }
        if let Some(v) = &options.savepath {
            form = form.text("savepath", v.clone());
        }
        if let Some(v) = &options.category {
            form = form.text("category", v.clone());
        }
        if let Some(tags) = &options.tags
            && version::is_at_least(reported.as_deref(), "4.2.0")
        {
            form = form.text("tags", tags.clone());
        }
        if options.paused {
            // v5 renamed the parameter; send both spellings.
            form = form.text("paused", "true").text("stopped", "true");
        }
        if let Some(layout) = &options.content_layout {
            match version::content_layout_param(reported.as_deref(), layout) {
                ContentLayoutParam::ContentLayout(v) => form = form.text("contentLayout", v),
                ContentLayoutParam::RootFolder(flag) => {
                    form = form.text("root_folder", flag.to_string());
                }
                ContentLayoutParam::Omit => {}
            }
        }
        if let Some(v) = &options.ratio_limit {
            form = form.text("ratioLimit", v.clone());
        }
        if let Some(v) = &options.seeding_time_limit {
            form = form.text("seedingTimeLimit", v.clone());
        }
        if let Some(v) = &options.up_limit {
            form = form.text("upLimit", v.clone());
        }
        if let Some(v) = &options.dl_limit {
            form = form.text("dlLimit", v.clone());
        }
        form
    }

    pub async fn export_torrent(&self, hash: &str) -> Result<Vec<u8>, QbError> {
        self.with_session(|cookie| {
            let req = self
                .http
                .get(format!("{}/api/v2/torrents/export", self.base_url))
                .query(&[("hash", hash)])
                .header(COOKIE, cookie);
            async move {
                let resp = ensure_ok(req.send().await?).await?;
                Ok(resp.bytes().await?.to_vec())
            }
        })
        .await
    }

    pub async fn torrent_properties(&self, hash: &str) -> Result<Value, QbError> {
        self.get_json("/api/v2/torrents/properties", &[("hash", hash.to_string())])
            .await
    }

    pub async fn torrent_trackers(&self, hash: &str) -> Result<Vec<TrackerEntry>, QbError> {
        self.get_json("/api/v2/torrents/trackers", &[("hash", hash.to_string())])
            .await
    }

    /// Peer snapshot via the sync endpoint with rid=0 (full update); only the
    /// peers map is returned, the rid envelope is dropped.
    pub async fn torrent_peers(&self, hash: &str) -> Result<Value, QbError> {
        let data: Value = self
            .get_json(
                "/api/v2/sync/torrentPeers",
                &[("hash", hash.to_string()), ("rid", "0".to_string())],
            )
            .await?;
        Ok(data
            .get("peers")
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default())))
    }

    pub async fn torrent_files(&self, hash: &str) -> Result<Vec<TorrentContent>, QbError> {
        self.get_json("/api/v2/torrents/files", &[("hash", hash.to_string())])
            .await
    }

    /// `file_ids` is pipe-joined file indices.
    pub async fn set_file_priority(
        &self,
        hash: &str,
        file_ids: &str,
        priority: i64,
    ) -> Result<(), QbError> {
        self.post_form(
            "/api/v2/torrents/filePrio",
            &[
                ("hash", hash.to_string()),
                ("id", file_ids.to_string()),
                ("priority", priority.to_string()),
            ],
        )
        .await
    }

    pub async fn main_log(&self, last_known_id: i64) -> Result<Value, QbError> {
        self.get_json(
            "/api/v2/log/main",
            &[("last_known_id", last_known_id.to_string())],
        )
        .await
    }

    pub async fn preferences(&self) -> Result<Value, QbError> {
        self.get_json("/api/v2/app/preferences", &[]).await
    }

    pub async fn categories(&self) -> Result<Categories, QbError> {
        self.get_json("/api/v2/torrents/categories", &[]).await
    }

    pub async fn create_category(&self, category: &str, save_path: &str) -> Result<(), QbError> {
        self.post_form(
            "/api/v2/torrents/createCategory",
            &[
                ("category", category.to_string()),
                ("savePath", save_path.to_string()),
            ],
        )
        .await
    }

    pub async fn edit_category(&self, category: &str, save_path: &str) -> Result<(), QbError> {
        self.post_form(
            "/api/v2/torrents/editCategory",
            &[
                ("category", category.to_string()),
                ("savePath", save_path.to_string()),
            ],
        )
        .await
    }

    /// `categories` is newline-joined category names.
    pub async fn remove_categories(&self, categories: &str) -> Result<(), QbError> {
        self.post_form(
            "/api/v2/torrents/removeCategories",
            &[("categories", categories.to_string())],
        )
        .await
    }
}

#[async_trait]
impl TorrentLister for QbClient {
    async fn list_torrents(&self) -> Result<Vec<TorrentInfo>, QbError> {
        QbClient::list_torrents(self).await
    }
}

/// Maps a response to the client error taxonomy. 403 means the session
/// cookie is no longer honored; everything else non-2xx is a remote error
/// carried to the caller untouched.
async fn ensure_ok(resp: Response) -> Result<Response, QbError> {
    let status = resp.status();
    if status == StatusCode::FORBIDDEN {
        return Err(QbError::SessionExpired);
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(QbError::Remote { status, body });
    }
    Ok(resp)
}

/// The retry-once-after-relogin policy, factored out of [`QbClient`] so the
/// attempt accounting can be tested without a network.
pub(crate) async fn with_relogin<T, F, Fut, R, RFut>(op: F, relogin: R) -> Result<T, QbError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, QbError>>,
    R: FnOnce() -> RFut,
    RFut: Future<Output = Result<(), QbError>>,
{
    match op().await {
        Err(QbError::SessionExpired) => {
            relogin().await?;
            op().await
        }
        other => other,
    }
}
