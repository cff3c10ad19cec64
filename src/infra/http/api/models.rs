use serde::{Deserialize, Serialize};

/// Body of `POST /v1`. Fields are optional so a missing one maps to 400.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddKeyValueRequest {
    pub new_key: Option<String>,
    pub value: Option<String>,
}

/// Body of `PUT /v1`.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateKeyValueRequest {
    pub key: Option<String>,
    pub new_value: Option<String>,
}

/// Body of `DELETE /v1`.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveKeyRequest {
    pub key: Option<String>,
}
