use serde::{Deserialize, Serialize};

use crate::error::{CoreResult, SearchError};

/// Producer phase reported on each record. `ResultsReady` is the only terminal stage.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(from = "String", into = "String")]
pub enum Stage {
    Starting,
    QueriedGoogle,
    DownloadedWebpages,
    QueriedLlm,
    ResultsReady,
    /// Any stage string this client does not know; never terminal.
    Other(String),
}

impl Stage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ResultsReady)
    }

    /// Symbolic wire name.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Starting => "STARTING",
            Self::QueriedGoogle => "QUERIED_GOOGLE",
            Self::DownloadedWebpages => "DOWNLOADED_WEBPAGES",
            Self::QueriedLlm => "QUERIED_LLM",
            Self::ResultsReady => "RESULTS_READY",
            Self::Other(s) => s.as_str(),
        }
    }
}

impl From<String> for Stage {
    fn from(s: String) -> Self {
        // The producer may send either the enum name or its human label.
        match s.as_str() {
            "STARTING" | "Starting search" => Self::Starting,
            "QUERIED_GOOGLE" | "Querying Google" => Self::QueriedGoogle,
            "DOWNLOADED_WEBPAGES" | "Downloading Webpages" => Self::DownloadedWebpages,
            "QUERIED_LLM" | "Querying LLM" => Self::QueriedLlm,
            "RESULTS_READY" | "Results ready" => Self::ResultsReady,
            _ => Self::Other(s),
        }
    }
}

impl From<Stage> for String {
    fn from(s: Stage) -> Self {
        match s {
            Stage::Other(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One web search result as rendered in the sources list.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Document {
    /// Opaque; the service numbers results, so integer ids are stored as their decimal text.
    #[serde(deserialize_with = "de_doc_id")]
    pub id: String,
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub text: String,
}

fn de_doc_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DocId {
        Text(String),
        Int(i64),
        Uint(u64),
    }
    Ok(match DocId::deserialize(deserializer)? {
        DocId::Text(s) => s,
        DocId::Int(n) => n.to_string(),
        DocId::Uint(n) => n.to_string(),
    })
}

/// One decoded unit of the response stream.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SearchRecord {
    pub success: bool,
    pub stage: Option<Stage>,
    pub num_tokens_used: u64,
    pub documents: Vec<Document>,
    pub answer: String,
    pub error_message: Option<String>,
}

impl SearchRecord {
    /// Parse one record's JSON text.
    ///
    /// Invalid JSON maps to `MalformedRecord`; JSON that lacks the fields a
    /// record of its kind must carry maps to `InvalidRecord`.
    pub fn from_json(text: &str) -> CoreResult<Self> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| SearchError::MalformedRecord {
                reason: e.to_string(),
            })?;
        let wire: WireRecord =
            serde_json::from_value(value).map_err(|e| SearchError::InvalidRecord {
                reason: e.to_string(),
            })?;
        wire.into_record()
    }

    pub fn is_terminal(&self) -> bool {
        self.success && self.stage.as_ref().is_some_and(Stage::is_terminal)
    }
}

// ---- Wire struct ----
#[derive(Deserialize)]
struct WireRecord {
    success: bool,
    #[serde(default)]
    stage: Option<Stage>,
    #[serde(default)]
    num_tokens_used: Option<u64>,
    #[serde(default)]
    websearch_docs: Option<Vec<Document>>,
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl WireRecord {
    fn into_record(self) -> CoreResult<SearchRecord> {
        if !self.success {
            return Ok(SearchRecord {
                success: false,
                stage: None,
                num_tokens_used: 0,
                documents: Vec::new(),
                answer: String::new(),
                error_message: self.message,
            });
        }
        let missing = |field: &str| SearchError::InvalidRecord {
            reason: format!("missing field `{field}`"),
        };
        Ok(SearchRecord {
            success: true,
            stage: self.stage,
            num_tokens_used: self.num_tokens_used.ok_or_else(|| missing("num_tokens_used"))?,
            documents: self.websearch_docs.ok_or_else(|| missing("websearch_docs"))?,
            answer: self.answer.ok_or_else(|| missing("answer"))?,
            error_message: None,
        })
    }
}

/// One finalized prompt/answer pair. Never mutated after it enters the history.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationTurn {
    pub user_prompt: String,
    pub assistant_response: String,
}

/// Body POSTed to the search endpoint.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub user_prompt: String,
    pub conversation_history: Vec<ConversationTurn>,
}
