//! Voice catalogue lookups.

use crate::{
    client::{Page, UltravoxClient, paging},
    error::ApiError,
};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Voice {
    pub voice_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// One page of `GET voices`.
pub type VoicePage = Page<Voice>;

impl UltravoxClient {
    pub async fn list_voices(&self, limit: u32, offset: u32) -> Result<VoicePage, ApiError> {
        self.request::<(), _>(Method::GET, "voices", &paging(limit, offset), None)
            .await
    }
}
