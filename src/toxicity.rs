use crate::config::{Community, ToxicityConfig};
use crate::events::Comment;
use crate::executor::Effect;
use anyhow::Context;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

pub trait ToxicityClassifier: Send + Sync {
    /// Probability in `0.0..=1.0` that `text` is toxic.
    fn toxicity(&self, text: &str) -> anyhow::Result<f64>;
}

/// Client for a Perspective-compatible `comments:analyze` endpoint.
pub struct PerspectiveClient {
    client: Client,
    endpoint: Url,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeRequest<'a> {
    comment: CommentText<'a>,
    requested_attributes: RequestedAttributes,
    do_not_store: bool,
}

#[derive(Serialize)]
struct CommentText<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
struct RequestedAttributes {
    toxicity: serde_json::Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeResponse {
    attribute_scores: AttributeScores,
}

#[derive(Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
struct AttributeScores {
    toxicity: AttributeScore,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttributeScore {
    summary_score: SummaryScore,
}

#[derive(Deserialize)]
struct SummaryScore {
    value: f64,
}

impl PerspectiveClient {
    pub fn new(config: &ToxicityConfig) -> anyhow::Result<Self> {
        let endpoint = Url::parse_with_params(&config.endpoint, &[("key", &config.api_key)])
            .with_context(|| format!("Invalid toxicity endpoint: {}", config.endpoint))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(concat!("modwarden/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { client, endpoint })
    }
}

impl ToxicityClassifier for PerspectiveClient {
    fn toxicity(&self, text: &str) -> anyhow::Result<f64> {
        let request = AnalyzeRequest {
            comment: CommentText { text },
            requested_attributes: RequestedAttributes {
                toxicity: serde_json::json!({}),
            },
            do_not_store: true,
        };

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&request)
            .send()
            .context("Toxicity request failed")?;
        if !response.status().is_success() {
            anyhow::bail!("Toxicity endpoint returned {}", response.status());
        }

        let body = response.text().context("Failed to read toxicity response")?;
        parse_score(&body)
    }
}

fn parse_score(body: &str) -> anyhow::Result<f64> {
    let parsed: AnalyzeResponse =
        serde_json::from_str(body).context("Unexpected toxicity response")?;
    Ok(parsed.attribute_scores.toxicity.summary_score.value)
}

/// Reports comments whose toxicity reaches the community threshold.
pub struct CommentScreener {
    classifier: Arc<dyn ToxicityClassifier>,
}

impl CommentScreener {
    pub fn new(classifier: Arc<dyn ToxicityClassifier>) -> Self {
        Self { classifier }
    }

    /// A classifier failure, or a score outside `0..=1`, counts as not toxic.
    pub fn screen(&self, comment: &Comment, community: &Community) -> Vec<Effect> {
        if !community.features.toxicity || comment.body.trim().is_empty() {
            return Vec::new();
        }

        let score = match self.classifier.toxicity(&comment.body) {
            Ok(score) if score.is_finite() && (0.0..=1.0).contains(&score) => score,
            Ok(score) => {
                log::warn!("Toxicity check for {} returned unusable score {score}", comment.id);
                return Vec::new();
            }
            Err(e) => {
                log::warn!("Toxicity check failed for {}: {e:#}", comment.id);
                return Vec::new();
            }
        };

        log::debug!("Comment {} by {} scored {score:.2}", comment.id, comment.author);
        if score < community.toxicity_threshold {
            return Vec::new();
        }

        log::info!(
            "Reporting comment {} by {} (toxicity {score:.2})",
            comment.id,
            comment.author
        );
        vec![Effect::ReportContent {
            target: comment.content_ref(),
            reason: format!("Toxicity {score:.2}"),
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Features;
    use crate::testing::at;

    struct FixedScore(Option<f64>);

    impl ToxicityClassifier for FixedScore {
        fn toxicity(&self, _text: &str) -> anyhow::Result<f64> {
            self.0.ok_or_else(|| anyhow::anyhow!("classifier unavailable"))
        }
    }

    fn community(toxicity: bool) -> Community {
        Community {
            name: "collapse".to_string(),
            features: Features {
                toxicity,
                ..Features::default()
            },
            ..Community::default()
        }
    }

    fn comment(body: &str) -> Comment {
        Comment {
            id: "t1_c1".to_string(),
            author: "someone".to_string(),
            body: body.to_string(),
            url: Some("https://www.reddit.com/r/collapse/comments/abc/x/c1/".to_string()),
            created_at: at(1_000),
        }
    }

    #[test]
    fn test_toxic_comment_is_reported() {
        let screener = CommentScreener::new(Arc::new(FixedScore(Some(0.97))));
        let effects = screener.screen(&comment("awful"), &community(true));
        assert!(matches!(
            &effects[..],
            [Effect::ReportContent { target, reason }]
                if target.id == "t1_c1" && reason == "Toxicity 0.97"
        ));
    }

    #[test]
    fn test_below_threshold_is_ignored() {
        let screener = CommentScreener::new(Arc::new(FixedScore(Some(0.5))));
        assert!(screener.screen(&comment("meh"), &community(true)).is_empty());
    }

    #[test]
    fn test_classifier_failure_is_not_toxic() {
        let screener = CommentScreener::new(Arc::new(FixedScore(None)));
        assert!(screener.screen(&comment("awful"), &community(true)).is_empty());
    }

    #[test]
    fn test_unusable_scores_are_not_toxic() {
        for score in [f64::NAN, f64::INFINITY, 1.5, -0.2] {
            let screener = CommentScreener::new(Arc::new(FixedScore(Some(score))));
            assert!(screener.screen(&comment("awful"), &community(true)).is_empty());
        }
    }

    #[test]
    fn test_feature_flag_off_skips_scoring() {
        let screener = CommentScreener::new(Arc::new(FixedScore(Some(1.0))));
        assert!(screener.screen(&comment("awful"), &community(false)).is_empty());
    }

    #[test]
    fn test_parse_score() {
        let body = r#"{"attributeScores":{"TOXICITY":{"spanScores":[],
            "summaryScore":{"value":0.8123,"type":"PROBABILITY"}}},"languages":["en"]}"#;
        assert!((parse_score(body).unwrap() - 0.8123).abs() < f64::EPSILON);
        assert!(parse_score("{}").is_err());
    }

    #[test]
    fn test_client_puts_key_in_query() {
        let client = PerspectiveClient::new(&ToxicityConfig {
            endpoint: "https://commentanalyzer.googleapis.com/v1alpha1/comments:analyze"
                .to_string(),
            api_key: "secret".to_string(),
            timeout_seconds: 5,
        })
        .unwrap();
        assert_eq!(client.endpoint.query(), Some("key=secret"));
    }
}
