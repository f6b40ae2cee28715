use serde::Serialize;

pub const WEIGHT_ACADEMIC: f64 = 0.30;
pub const WEIGHT_BEHAVIORAL: f64 = 0.25;
pub const WEIGHT_ATTENDANCE: f64 = 0.25;
pub const WEIGHT_SOCIAL: f64 = 0.20;

/// Current academic/behavioral/attendance/social-emotional figures for one
/// student, captured at a point in time. Write-once per intervention side.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub academic: f64,
    pub behavioral: f64,
    pub attendance: f64,
    pub social_emotional: f64,
    pub risk_level: String,
    pub captured_ts: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EffectivenessLevel {
    VeryEffective,
    Effective,
    PartiallyEffective,
    NotEffective,
    Pending,
}

impl EffectivenessLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::VeryEffective => "VERY_EFFECTIVE",
            Self::Effective => "EFFECTIVE",
            Self::PartiallyEffective => "PARTIALLY_EFFECTIVE",
            Self::NotEffective => "NOT_EFFECTIVE",
            Self::Pending => "PENDING",
        }
    }

    pub fn for_score(score: f64) -> Self {
        if score >= 85.0 {
            Self::VeryEffective
        } else if score >= 70.0 {
            Self::Effective
        } else if score >= 50.0 {
            Self::PartiallyEffective
        } else {
            Self::NotEffective
        }
    }
}

/// Signed percent change per dimension plus the composite score. Per-dimension
/// impacts are not clamped; the composite always lands in [0, 100].
#[derive(Debug, Clone, PartialEq)]
pub struct ImpactResult {
    pub academic: f64,
    pub behavioral: f64,
    pub attendance: f64,
    pub social_emotional: f64,
    pub overall_effectiveness: f64,
    pub level: EffectivenessLevel,
}

/// Percent change of post vs pre. A zero baseline yields 0.0: with nothing to
/// measure against, the dimension is treated as unchanged rather than
/// producing an infinity.
fn percent_impact(pre: f64, post: f64) -> f64 {
    if pre == 0.0 {
        return 0.0;
    }
    (post - pre) / pre * 100.0
}

fn clamp(lo: f64, hi: f64, v: f64) -> f64 {
    v.max(lo).min(hi)
}

pub fn evaluate(pre: &MetricsSnapshot, post: &MetricsSnapshot) -> ImpactResult {
    let academic = percent_impact(pre.academic, post.academic);
    let behavioral = percent_impact(pre.behavioral, post.behavioral);
    let attendance = percent_impact(pre.attendance, post.attendance);
    let social_emotional = percent_impact(pre.social_emotional, post.social_emotional);

    let weighted = academic * WEIGHT_ACADEMIC
        + behavioral * WEIGHT_BEHAVIORAL
        + attendance * WEIGHT_ATTENDANCE
        + social_emotional * WEIGHT_SOCIAL;
    // No-change scores exactly 50; the weighted percent change is halved
    // before centering so +/-100% across the board saturates the scale.
    let overall_effectiveness = clamp(0.0, 100.0, 50.0 + weighted / 2.0);

    ImpactResult {
        academic,
        behavioral,
        attendance,
        social_emotional,
        overall_effectiveness,
        level: EffectivenessLevel::for_score(overall_effectiveness),
    }
}
