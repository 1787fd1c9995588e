// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Serve a per-character web app manifest.
//!
//! The manifest is built from a character data response that the browser
//! fetches on its own. Both flows carry the character page as `Referer`, which
//! is the key they meet under in the [`DataBroker`]. Either side may come
//! first.

use crate::broker::DataBroker;
use crate::filter::FlowFilter;
use crate::flow::{FlowRequest, FlowResponse};
use crate::interceptor::{status_only, synthesize, Interceptor, ProxyBody};
use async_trait::async_trait;
use hyper::{header, HeaderMap, Method, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const CONTENT_TYPE: &str = "application/manifest+json";
pub const DESCRIPTION: &str =
    "An official digital toolset for Fifth Edition (5e) Dungeons & Dragons (D&D).";
pub const DEFAULT_AVATAR_URL: &str =
    "https://www.dndbeyond.com/Content/Skins/Waterdeep/images/characters/default-avatar-builder.png";
pub const ICON_SIZES: &str = "192x192";

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("character data is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("character name is empty")]
    EmptyName,
}

#[derive(Debug, Deserialize)]
struct CharacterEnvelope {
    data: CharacterData,
}

#[derive(Debug, Deserialize)]
struct CharacterData {
    name: String,
    #[serde(default)]
    decorations: Decorations,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Decorations {
    avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Icon {
    pub src: String,
    pub sizes: String,
    #[serde(rename = "type")]
    pub mime: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebManifest {
    pub name: String,
    pub short_name: String,
    pub description: String,
    pub icons: Vec<Icon>,
    pub display: String,
    pub start_url: String,
}

/// Build the manifest for a character data body.
pub fn render_manifest(data: &[u8], start_url: &str) -> Result<WebManifest, ManifestError> {
    let envelope: CharacterEnvelope = serde_json::from_slice(data)?;
    let character = envelope.data;
    if character.name.trim().is_empty() {
        return Err(ManifestError::EmptyName);
    }

    let icon = match character.decorations.avatar_url.filter(|u| !u.is_empty()) {
        Some(src) => Icon {
            src,
            sizes: ICON_SIZES.to_string(),
            mime: "image/webp".to_string(),
        },
        None => Icon {
            src: DEFAULT_AVATAR_URL.to_string(),
            sizes: ICON_SIZES.to_string(),
            mime: "image/png".to_string(),
        },
    };

    Ok(WebManifest {
        name: format!("{} - D&D Beyond", character.name),
        short_name: character.name,
        description: DESCRIPTION.to_string(),
        icons: vec![icon],
        display: "fullscreen".to_string(),
        start_url: start_url.to_string(),
    })
}

pub struct ServeWebManifest {
    filter: FlowFilter,
    data_filter: FlowFilter,
    broker: DataBroker,
    timeout: Duration,
}

impl ServeWebManifest {
    pub fn new(
        filter: FlowFilter,
        data_filter: FlowFilter,
        broker: DataBroker,
        timeout: Duration,
    ) -> Self {
        Self {
            filter,
            data_filter,
            broker,
            timeout,
        }
    }

    pub fn broker(&self) -> &DataBroker {
        &self.broker
    }

    fn is_data_request(&self, req: &FlowRequest) -> bool {
        req.method == Method::GET
            && req.referer().is_some()
            && self.data_filter.matches(&req.method, &req.uri)
    }
}

#[async_trait]
impl Interceptor for ServeWebManifest {
    fn name(&self) -> &'static str {
        "serve-webmanifest"
    }

    async fn request(&self, req: &FlowRequest) -> Option<Response<ProxyBody>> {
        if !self.filter.matches(&req.method, &req.uri) {
            return None;
        }
        let Some(referer) = req.referer() else {
            warn!(uri = %req.uri, "webmanifest request without referer");
            return Some(status_only(StatusCode::BAD_REQUEST));
        };
        info!(%referer, "webmanifest request");

        let data = match self.broker.get(referer, self.timeout).await {
            Ok(data) => data,
            Err(e) => {
                error!(%referer, error = %e, "timeout while waiting for character data");
                return Some(status_only(StatusCode::NOT_FOUND));
            }
        };

        let manifest = match render_manifest(&data, referer) {
            Ok(m) => m,
            Err(e) => {
                error!(%referer, error = %e, "malformed character data");
                return Some(status_only(StatusCode::BAD_GATEWAY));
            }
        };
        match serde_json::to_vec(&manifest) {
            Ok(body) => Some(synthesize(StatusCode::OK, body, Some(CONTENT_TYPE))),
            Err(e) => {
                error!(%referer, error = %e, "failed to serialize manifest");
                Some(status_only(StatusCode::INTERNAL_SERVER_ERROR))
            }
        }
    }

    fn prepare_upstream(&self, req: &FlowRequest, headers: &mut HeaderMap) {
        // The captured body is parsed as-is, so ask for it uncompressed.
        if self.is_data_request(req) {
            headers.remove(header::ACCEPT_ENCODING);
        }
    }

    fn response(&self, req: &FlowRequest, resp: &FlowResponse) {
        if !self.is_data_request(req) {
            return;
        }
        let Some(referer) = req.referer() else {
            return;
        };
        if !resp.status.is_success() {
            debug!(%referer, status = %resp.status, "ignoring unsuccessful character data response");
            return;
        }
        if !resp.is_identity_encoded() {
            warn!(%referer, "character data response is content-encoded, not captured");
            return;
        }
        info!(%referer, "captured character data response");
        self.broker.set(referer, resp.body.clone());
    }
}
