//! Wire types of the `admission.k8s.io/v1` review exchange.
//!
//! The object payloads stay raw JSON here; each handler decodes the kind
//! it expects and maps a failure to 422. Patches go out base64-encoded as
//! the API server requires.

use serde::{Deserialize, Serialize};

pub const API_VERSION: &str = "admission.k8s.io/v1";
pub const KIND: &str = "AdmissionReview";

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReview {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<AdmissionRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<AdmissionResponse>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    pub uid: String,
    #[serde(default)]
    pub kind: GroupVersionKind,
    pub operation: Operation,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_object: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupVersionKind {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub kind: String,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Create,
    Update,
    Delete,
    Connect,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResponse {
    pub uid: String,
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ResponseStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
}

impl AdmissionRequest {
    /// Decodes the request's object into the expected kind; a mismatch is
    /// an unprocessable payload, not a policy decision.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, super::AdmissionError> {
        let value = self
            .object
            .clone()
            .ok_or_else(|| super::AdmissionError::Unprocessable("request carries no object".into()))?;
        serde_json::from_value(value)
            .map_err(|e| super::AdmissionError::Unprocessable(format!("cannot decode object: {}", e)))
    }

    pub fn decode_old<T: serde::de::DeserializeOwned>(
        &self,
    ) -> Result<Option<T>, super::AdmissionError> {
        match &self.old_object {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone()).map(Some).map_err(|e| {
                super::AdmissionError::Unprocessable(format!("cannot decode old object: {}", e))
            }),
        }
    }
}

impl AdmissionResponse {
    pub fn allow(uid: &str) -> Self {
        AdmissionResponse {
            uid: uid.to_string(),
            allowed: true,
            status: None,
            patch: None,
            patch_type: None,
            warnings: Vec::new(),
        }
    }

    /// Policy denial: HTTP stays 200, the embedded result carries 403 the
    /// way the API server reports admission refusals.
    pub fn deny(uid: &str, message: impl ToString) -> Self {
        AdmissionResponse {
            uid: uid.to_string(),
            allowed: false,
            status: Some(ResponseStatus {
                status: Some("Failure".to_string()),
                message: Some(message.to_string()),
                reason: Some("Forbidden".to_string()),
                code: Some(403),
            }),
            patch: None,
            patch_type: None,
            warnings: Vec::new(),
        }
    }

    pub fn with_patch(mut self, patch: &json_patch::Patch) -> Result<Self, serde_json::Error> {
        let raw = serde_json::to_vec(patch)?;
        self.patch = Some(base64::encode(raw));
        self.patch_type = Some("JSONPatch".to_string());
        Ok(self)
    }

    pub fn into_review(self) -> AdmissionReview {
        AdmissionReview {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            request: None,
            response: Some(self),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn review_decodes_the_api_server_shape() {
        let raw = serde_json::json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": {"group": "", "version": "v1", "kind": "Pod"},
                "operation": "CREATE",
                "namespace": "ml",
                "object": {"metadata": {"name": "trainer"}},
            }
        });
        let review: AdmissionReview = serde_json::from_value(raw).unwrap();
        let request = review.request.unwrap();
        assert_eq!(request.operation, Operation::Create);
        assert_eq!(request.namespace.as_deref(), Some("ml"));
        assert_eq!(request.kind.kind, "Pod");
    }

    #[test]
    fn patch_is_base64_json_patch() {
        let before = serde_json::json!({"a": 1});
        let after = serde_json::json!({"a": 2});
        let patch = json_patch::diff(&before, &after);
        let response = AdmissionResponse::allow("uid").with_patch(&patch).unwrap();
        assert_eq!(response.patch_type.as_deref(), Some("JSONPatch"));
        let decoded = base64::decode(response.patch.unwrap()).unwrap();
        let parsed: json_patch::Patch = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(parsed, patch);
    }

    #[test]
    fn deny_carries_forbidden_result() {
        let response = AdmissionResponse::deny("uid", "multiple GPU pools requested");
        assert!(!response.allowed);
        let status = response.status.unwrap();
        assert_eq!(status.code, Some(403));
        assert_eq!(
            status.message.as_deref(),
            Some("multiple GPU pools requested")
        );
    }
}
