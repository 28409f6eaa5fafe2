/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::path::PathBuf;

use anyhow::{Context, Result};
use directories::ProjectDirs;

use crate::peer::DEFAULT_CANDIDATE_QUEUE;

#[derive(Debug, Clone, Default)]
pub struct IceConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket base, e.g. `ws://127.0.0.1:3000`.
    pub server_ws: String,
    pub room_id: Option<String>,
    pub username: String,
    pub ice: IceConfig,
    pub data_dir: PathBuf,
    pub media_enabled: bool,
    pub candidate_queue: usize,
}

impl ClientConfig {
    /// HTTP base of the relay, derived from the WebSocket base.
    pub fn server_http(&self) -> String {
        http_base(&self.server_ws)
    }

    /// Full session URL including the url-encoded username.
    pub fn session_url(&self) -> String {
        format!(
            "{}/ws?username={}",
            self.server_ws.trim_end_matches('/'),
            urlencoding::encode(&self.username)
        )
    }
}

fn http_base(ws: &str) -> String {
    let ws = ws.trim_end_matches('/');
    if let Some(rest) = ws.strip_prefix("wss://") {
        format!("https://{rest}")
    } else if let Some(rest) = ws.strip_prefix("ws://") {
        format!("http://{rest}")
    } else {
        ws.to_string()
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn default_data_dir() -> Result<PathBuf> {
    if let Some(v) = env_nonempty("ROOMS_DATA_DIR") {
        return Ok(PathBuf::from(v));
    }
    let proj = ProjectDirs::from("net", "rooms", "Rooms").context("unable to determine platform data dir")?;
    Ok(proj.data_local_dir().to_path_buf())
}

pub fn load_client_config() -> Result<ClientConfig> {
    let server_ws = env_nonempty("ROOMS_SERVER_WS").unwrap_or_else(|| "ws://127.0.0.1:3000".to_string());
    let username = env_nonempty("ROOMS_USERNAME").context("missing ROOMS_USERNAME")?;
    let room_id = env_nonempty("ROOMS_ROOM_ID");
    let urls = std::env::var("ROOMS_ICE_URLS")
        .ok()
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
        })
        .unwrap_or_else(|| vec!["stun:stun.l.google.com:19302".to_string()]);
    let ice = IceConfig {
        urls,
        username: env_nonempty("ROOMS_ICE_USERNAME"),
        credential: env_nonempty("ROOMS_ICE_CREDENTIAL"),
    };
    let candidate_queue = std::env::var("ROOMS_CANDIDATE_QUEUE")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(DEFAULT_CANDIDATE_QUEUE)
        .clamp(1, 1024);
    Ok(ClientConfig {
        server_ws,
        room_id,
        username,
        ice,
        data_dir: default_data_dir()?,
        media_enabled: env_flag("ROOMS_MEDIA", true),
        candidate_queue,
    })
}
