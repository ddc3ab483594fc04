//! Text embeddings and vector similarity.
//!
//! [`HttpEmbedder`] talks to either an OpenAI-compatible `/embeddings`
//! endpoint (bearer auth) or an Azure OpenAI deployment (`api-key`
//! header).  Both accept a batch of inputs per request.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use crate::config::EmbeddingConfig;
use crate::utils::cap_chars;

/// Inputs longer than this are cut before being sent.
pub const MAX_INPUT_CHARS: usize = 8000;

const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1/embeddings";
const DEFAULT_OPENAI_MODEL: &str = "text-embedding-3-small";
const DEFAULT_AZURE_API_VERSION: &str = "2024-10-21";

/// Produces one vector per input text, in input order.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;

    /// Embed a single text.
    async fn embed_one(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let mut out = self.embed(&[text.to_string()]).await?;
        out.pop().context("embedding backend returned no vector")
    }
}

// ---------------------------------------------------------------------------
// HTTP backend
// ---------------------------------------------------------------------------

enum Backend {
    OpenAi { url: String, model: String },
    Azure { url: String },
}

/// Embedder over HTTP.
pub struct HttpEmbedder {
    backend: Backend,
    api_key: String,
    client: Client,
}

impl HttpEmbedder {
    pub fn from_config(cfg: &EmbeddingConfig) -> anyhow::Result<Self> {
        let backend = match cfg.provider.as_str() {
            "openai" => Backend::OpenAi {
                url: cfg
                    .endpoint
                    .clone()
                    .unwrap_or_else(|| DEFAULT_OPENAI_URL.to_string()),
                model: cfg
                    .model
                    .clone()
                    .unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
            },
            "azure-openai" => {
                let endpoint = cfg
                    .endpoint
                    .as_deref()
                    .context("azure-openai embedding requires an endpoint")?
                    .trim_end_matches('/');
                let deployment = cfg
                    .deployment
                    .as_deref()
                    .context("azure-openai embedding requires a deployment")?;
                let version = cfg
                    .api_version
                    .as_deref()
                    .unwrap_or(DEFAULT_AZURE_API_VERSION);
                Backend::Azure {
                    url: format!(
                        "{endpoint}/openai/deployments/{deployment}/embeddings?api-version={version}"
                    ),
                }
            }
            other => anyhow::bail!("unknown embedding provider '{other}'"),
        };

        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("build embedding HTTP client")?;

        Ok(Self {
            backend,
            api_key: cfg.api_key.clone(),
            client,
        })
    }

    fn request(&self, texts: &[String]) -> reqwest::RequestBuilder {
        let input: Vec<String> = texts.iter().map(|t| cap_chars(t, MAX_INPUT_CHARS)).collect();
        match &self.backend {
            Backend::OpenAi { url, model } => self
                .client
                .post(url)
                .bearer_auth(&self.api_key)
                .json(&json!({ "model": model, "input": input })),
            Backend::Azure { url } => self
                .client
                .post(url)
                .header("api-key", &self.api_key)
                .json(&json!({ "input": input })),
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let resp = self
            .request(texts)
            .send()
            .await
            .context("embedding request failed")?;
        let status = resp.status();
        if !status.is_success() {
            let msg = resp.text().await.unwrap_or_default();
            anyhow::bail!(
                "Embeddings API returned {status}: {}",
                crate::utils::truncate_str(&msg, 300)
            );
        }
        let body: serde_json::Value = resp.json().await.context("decode embedding response")?;
        let vecs = parse_embeddings(&body)?;
        if vecs.len() != texts.len() {
            anyhow::bail!(
                "embedding count mismatch: sent {}, received {}",
                texts.len(),
                vecs.len()
            );
        }
        Ok(vecs)
    }
}

/// Extract `data[*].embedding`, ordered by `index` when present.
fn parse_embeddings(body: &serde_json::Value) -> anyhow::Result<Vec<Vec<f32>>> {
    let data = body["data"]
        .as_array()
        .context("embedding response has no data array")?;
    let mut indexed: Vec<(u64, Vec<f32>)> = data
        .iter()
        .enumerate()
        .map(|(pos, item)| {
            let idx = item["index"].as_u64().unwrap_or(pos as u64);
            let vec = item["embedding"]
                .as_array()
                .map(|e| e.iter().filter_map(|v| v.as_f64().map(|f| f as f32)).collect())
                .unwrap_or_default();
            (idx, vec)
        })
        .collect();
    indexed.sort_by_key(|(idx, _)| *idx);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ---------------------------------------------------------------------------
// Similarity
// ---------------------------------------------------------------------------

/// Cosine similarity between two vectors.  Zero when either is a zero vector.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let x = *x as f64;
        let y = *y as f64;
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    let denom = na.sqrt() * nb.sqrt();
    if denom < 1e-12 {
        0.0
    } else {
        dot / denom
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn cosine_similarity_identical_vectors() {
        let v = vec![1.0f32, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_orthogonal_vectors() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_opposite_vectors() {
        let sim = cosine_similarity(&[1.0, 2.0, 3.0], &[-1.0, -2.0, -3.0]);
        assert!((sim + 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_zero_vector() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[0.0, 0.0]), 0.0);
    }

    #[test]
    fn response_parsing_respects_index() {
        let body = json!({
            "data": [
                { "index": 1, "embedding": [0.0, 1.0] },
                { "index": 0, "embedding": [1.0, 0.0] }
            ]
        });
        let vecs = parse_embeddings(&body).unwrap();
        assert_eq!(vecs, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn azure_url_is_deployment_scoped() {
        let e = HttpEmbedder::from_config(&EmbeddingConfig {
            provider: "azure-openai".into(),
            api_key: "k".into(),
            endpoint: Some("https://res.openai.azure.com/".into()),
            model: None,
            deployment: Some("emb".into()),
            api_version: None,
        })
        .unwrap();
        match e.backend {
            Backend::Azure { url } => assert_eq!(
                url,
                "https://res.openai.azure.com/openai/deployments/emb/embeddings?api-version=2024-10-21"
            ),
            _ => panic!("expected azure backend"),
        }
    }

    #[tokio::test]
    async fn openai_backend_sends_bearer_and_batch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    { "index": 0, "embedding": [0.5, 0.5] },
                    { "index": 1, "embedding": [0.1, 0.9] }
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let e = HttpEmbedder::from_config(&EmbeddingConfig {
            provider: "openai".into(),
            api_key: "sk-test".into(),
            endpoint: Some(format!("{}/v1/embeddings", server.uri())),
            model: None,
            deployment: None,
            api_version: None,
        })
        .unwrap();
        let out = e.embed(&["a".into(), "b".into()]).await.unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[1], vec![0.1, 0.9]);
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;
        let e = HttpEmbedder::from_config(&EmbeddingConfig {
            provider: "openai".into(),
            api_key: "k".into(),
            endpoint: Some(server.uri()),
            model: None,
            deployment: None,
            api_version: None,
        })
        .unwrap();
        let err = e.embed_one("x").await.unwrap_err();
        assert!(err.to_string().contains("429"));
    }
}
