//! The synthesized Worker Job Request Message: the JSON payload sent to the
//! Worker subprocess over the length-prefixed stdin protocol, and served
//! back out via the `/JobRequest` callback endpoint.

use std::collections::HashMap;

use getset::Getters;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ext::secrecy::ComparableSecretString;

/// The frame header for the Worker stdin protocol: two big-endian `u32`s,
/// `{message_id, payload_len}`, followed by `payload_len` bytes of UTF-8 JSON.
pub const FRAME_HEADER_LEN: usize = 8;

/// Message id for a [`JobRequestMessage`] frame.
pub const MESSAGE_ID_NEW_JOB_REQUEST: u32 = 1;

/// Message id for a cancel frame (same payload as the job request).
pub const MESSAGE_ID_CANCEL_REQUEST: u32 = 2;

/// The assembled message handed to the Worker, and later replayed (with its
/// connection details rewritten) over `/JobRequest`.
#[derive(Debug, Clone, Serialize, Deserialize, Getters)]
#[serde(rename_all = "camelCase")]
pub struct JobRequestMessage {
    /// A freshly generated plan identifier.
    #[getset(get = "pub")]
    plan_id: Uuid,

    /// A freshly generated timeline identifier.
    #[getset(get = "pub")]
    timeline_id: Uuid,

    /// A freshly generated job id, used as the top-level timeline record id.
    #[getset(get = "pub")]
    job_id: Uuid,

    /// Endpoints the Worker can call back into; always exactly one,
    /// `SYSTEMVSSCONNECTION`, pointing at the local callback server.
    #[getset(get = "pub")]
    resources: Resources,

    /// The ordered list of translated steps.
    #[getset(get = "pub")]
    steps: Vec<ActionStep>,

    /// System feature flags and secrets, the latter marked sensitive.
    #[getset(get = "pub")]
    variables: HashMap<String, Variable>,

    /// Context data exposed to the Worker: `github`, `matrix`, `strategy`, `inputs`, `needs`, `vars`.
    #[getset(get = "pub")]
    context_data: HashMap<String, serde_json::Value>,
}

impl JobRequestMessage {
    /// Construct a new message, generating fresh plan/timeline/job identifiers.
    pub fn new(
        resources: Resources,
        steps: Vec<ActionStep>,
        variables: HashMap<String, Variable>,
        context_data: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            plan_id: Uuid::new_v4(),
            timeline_id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            resources,
            steps,
            variables,
            context_data,
        }
    }

    /// Rewrite the `SYSTEMVSSCONNECTION` endpoint and cache server URL to the
    /// values a caller of `/JobRequest` provides; used because the Worker is
    /// told the callback address only once it calls back in.
    pub fn with_connection(mut self, url: String, cache_server_url: Option<String>) -> Self {
        self.resources.endpoint.url = url;
        self.resources.endpoint.cache_server_url = cache_server_url;
        self
    }
}

/// The endpoint collection handed to the Worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resources {
    /// The single `SYSTEMVSSCONNECTION` endpoint.
    pub endpoint: Endpoint,
}

/// The connection endpoint the Worker uses to reach the callback server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    /// Fixed identifier the Worker looks for: `SYSTEMVSSCONNECTION`.
    pub name: String,

    /// The callback server's listen address.
    pub url: String,

    /// The Forge-issued runtime token, presented as an OAuth bearer.
    #[serde(with = "token_serde")]
    pub oauth_token: ComparableSecretString,

    /// The artifact cache server URL, once started.
    pub cache_server_url: Option<String>,
}

impl Endpoint {
    /// Construct a new endpoint bound to the local callback server.
    pub fn new(url: String, oauth_token: ComparableSecretString) -> Self {
        Self {
            name: "SYSTEMVSSCONNECTION".to_owned(),
            url,
            oauth_token,
            cache_server_url: None,
        }
    }
}

/// One translated workflow step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionStep {
    /// A freshly generated identifier for this step.
    pub id: Uuid,

    /// The step's context name (`steps.<name>`), if declared.
    pub context_name: Option<String>,

    /// The step's human-readable display name.
    pub display_name: String,

    /// What the step runs.
    pub reference: StepReference,

    /// Step inputs, as string-valued template tokens.
    pub inputs: HashMap<String, String>,

    /// Step-level environment, as string-valued template tokens.
    pub environment: HashMap<String, String>,

    /// The step's (possibly rewritten) `if:` condition expression, if any.
    pub condition: Option<String>,

    /// The step timeout in minutes, if declared.
    pub timeout_in_minutes: Option<u32>,

    /// Whether a non-zero exit from this step should not fail the job.
    pub continue_on_error: bool,
}

/// What a step actually runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StepReference {
    /// A `run:` step: an inline shell script.
    Script {
        /// The script text.
        script: String,
        /// The shell to invoke it with, if overridden.
        shell: Option<String>,
        /// The working directory to run in, if overridden.
        working_directory: Option<String>,
    },
    /// `uses: docker://image` — run a container image directly.
    ContainerRegistry {
        /// The image reference.
        image: String,
    },
    /// A reusable action resolved by the callback server's repository resolution
    /// (covers both `owner/repo/path@ref` and rewritten `http(s)://` references).
    Repository {
        /// `self` for `./local` references, `GitHub` otherwise.
        repository_type: String,
        /// `owner/repo/path`, or just `path` for `self`.
        name_with_owner: String,
        /// The ref (tag, branch, or sha) to resolve against.
        reference: String,
    },
}

/// A variable exposed to the Worker, either a plain feature flag or a
/// sensitive job secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    /// The variable's value.
    #[serde(with = "variable_value_serde")]
    pub value: ComparableSecretString,

    /// Whether this variable must be redacted in logs (always true for job secrets).
    pub is_secret: bool,
}

impl Variable {
    /// A plain (non-secret) feature-flag style variable.
    pub fn plain<S: Into<String>>(value: S) -> Self {
        Self { value: ComparableSecretString::from(value.into()), is_secret: false }
    }

    /// A sensitive job secret.
    pub fn secret(value: ComparableSecretString) -> Self {
        Self { value, is_secret: true }
    }
}

mod token_serde {
    use secrecy::ExposeSecret;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::ComparableSecretString;

    pub fn serialize<S: Serializer>(value: &ComparableSecretString, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(value.expose_secret())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<ComparableSecretString, D::Error> {
        String::deserialize(de).map(ComparableSecretString::from)
    }
}

mod variable_value_serde {
    pub use super::token_serde::{deserialize, serialize};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_connection_rewrites_endpoint() {
        let endpoint = Endpoint::new("http://127.0.0.1:0".to_owned(), ComparableSecretString::from("tok"));
        let message = JobRequestMessage::new(Resources { endpoint }, vec![], HashMap::new(), HashMap::new());
        let rewritten = message.with_connection("http://10.0.0.5:4000".to_owned(), Some("http://10.0.0.5:4001".to_owned()));
        assert_eq!(rewritten.resources().endpoint.url, "http://10.0.0.5:4000");
        assert_eq!(rewritten.resources().endpoint.cache_server_url.as_deref(), Some("http://10.0.0.5:4001"));
    }

    #[test]
    fn serializes_job_request_as_json() {
        let endpoint = Endpoint::new("http://127.0.0.1:0".to_owned(), ComparableSecretString::from("tok"));
        let message = JobRequestMessage::new(Resources { endpoint }, vec![], HashMap::new(), HashMap::new());
        let json = serde_json::to_string(&message).expect("serializes");
        assert!(json.contains("planId"));
    }
}
