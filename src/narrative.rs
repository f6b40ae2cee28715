use crate::effectiveness::{EffectivenessLevel, ImpactResult, MetricsSnapshot};
use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

/// Capability handle for the external text-generation collaborator. Injected
/// into AppState so tests can swap providers; the daemon itself wires the
/// null provider and relies on the deterministic fallback.
pub trait TextGen {
    fn is_available(&self) -> bool;
    fn chat(&self, messages: &[ChatMessage], temperature: f64) -> anyhow::Result<String>;
}

pub struct NullTextGen;

impl TextGen for NullTextGen {
    fn is_available(&self) -> bool {
        false
    }

    fn chat(&self, _messages: &[ChatMessage], _temperature: f64) -> anyhow::Result<String> {
        anyhow::bail!("text generation collaborator not configured")
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Analysis {
    pub insights: Vec<String>,
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub success_factors: Vec<String>,
    #[serde(default)]
    pub challenges: Vec<String>,
}

/// Asks the collaborator for structured prose about a computed impact result.
/// Unavailability, transport errors, and unparsable replies all degrade
/// silently to the rule table; this never fails the caller.
pub fn analyze(
    gen: &dyn TextGen,
    impact: &ImpactResult,
    pre: &MetricsSnapshot,
    post: &MetricsSnapshot,
) -> Analysis {
    if gen.is_available() {
        let messages = build_messages(impact, pre, post);
        if let Ok(reply) = gen.chat(&messages, 0.4) {
            if let Some(parsed) = parse_reply(&reply) {
                return parsed;
            }
        }
    }
    fallback_analysis(impact)
}

fn build_messages(
    impact: &ImpactResult,
    pre: &MetricsSnapshot,
    post: &MetricsSnapshot,
) -> Vec<ChatMessage> {
    let system = "You are a school counseling analyst. Reply with a single JSON \
                  object with string-array fields: insights, recommendations, \
                  successFactors, challenges."
        .to_string();
    let user = format!(
        "Intervention impact (percent change): academic {:.1}, behavioral {:.1}, \
         attendance {:.1}, social-emotional {:.1}. Overall effectiveness {:.1} ({}). \
         Pre scores: academic {:.1}, behavioral {:.1}, attendance {:.1}, \
         social-emotional {:.1}, risk {}. Post scores: academic {:.1}, behavioral {:.1}, \
         attendance {:.1}, social-emotional {:.1}, risk {}.",
        impact.academic,
        impact.behavioral,
        impact.attendance,
        impact.social_emotional,
        impact.overall_effectiveness,
        impact.level.as_str(),
        pre.academic,
        pre.behavioral,
        pre.attendance,
        pre.social_emotional,
        pre.risk_level,
        post.academic,
        post.behavioral,
        post.attendance,
        post.social_emotional,
        post.risk_level,
    );
    vec![
        ChatMessage {
            role: "system",
            content: system,
        },
        ChatMessage {
            role: "user",
            content: user,
        },
    ]
}

// Providers tend to wrap the JSON in prose or code fences; take the outermost
// object and ignore the rest.
fn parse_reply(reply: &str) -> Option<Analysis> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&reply[start..=end]).ok()
}

fn fallback_analysis(impact: &ImpactResult) -> Analysis {
    let mut out = Analysis::default();

    if impact.academic > 10.0 {
        out.insights
            .push("Academic performance improved notably over the intervention period.".to_string());
        out.success_factors
            .push("Consistent academic support during the intervention.".to_string());
    } else if impact.academic < -10.0 {
        out.challenges
            .push("Academic performance declined despite the intervention.".to_string());
    }

    if impact.behavioral > 10.0 {
        out.insights
            .push("Behavioral incidents dropped measurably.".to_string());
        out.success_factors
            .push("Behavioral expectations were reinforced effectively.".to_string());
    } else if impact.behavioral < -10.0 {
        out.challenges
            .push("Behavioral incidents increased during the intervention.".to_string());
    }

    if impact.attendance > 5.0 {
        out.insights
            .push("Attendance improved during the intervention window.".to_string());
    } else if impact.attendance < -5.0 {
        out.challenges
            .push("Attendance slipped during the intervention window.".to_string());
    }

    if impact.social_emotional > 10.0 {
        out.insights
            .push("Social-emotional indicators moved in the right direction.".to_string());
    }

    match impact.level {
        EffectivenessLevel::VeryEffective | EffectivenessLevel::Effective => {
            out.recommendations
                .push("Continue the current intervention approach and monitor monthly.".to_string());
        }
        EffectivenessLevel::PartiallyEffective => {
            out.recommendations.push(
                "Adjust the intervention plan to target the dimensions that did not move."
                    .to_string(),
            );
        }
        EffectivenessLevel::NotEffective => {
            out.recommendations
                .push("Redesign the intervention with the support team.".to_string());
            out.challenges
                .push("The current approach did not produce measurable improvement.".to_string());
        }
        EffectivenessLevel::Pending => {
            out.recommendations
                .push("Await the post-intervention snapshot before drawing conclusions.".to_string());
        }
    }

    if out.insights.is_empty() {
        out.insights
            .push("Metrics held steady across the intervention period.".to_string());
    }

    out
}
