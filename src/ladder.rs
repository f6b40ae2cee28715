pub const ROLE_COUNSELOR: &str = "Counselor";
pub const ROLE_ASSISTANT_PRINCIPAL: &str = "Assistant Principal";
pub const ROLE_PRINCIPAL: &str = "Principal";

const CHAIN_CRITICAL: [&str; 3] = [ROLE_COUNSELOR, ROLE_ASSISTANT_PRINCIPAL, ROLE_PRINCIPAL];
const CHAIN_STANDARD: [&str; 2] = [ROLE_COUNSELOR, ROLE_ASSISTANT_PRINCIPAL];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskLevel {
    Low,
    Moderate,
    High,
    Critical,
}

impl RiskLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LOW" => Some(Self::Low),
            "MODERATE" => Some(Self::Moderate),
            "HIGH" => Some(Self::High),
            "CRITICAL" => Some(Self::Critical),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Moderate => "MODERATE",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationType {
    RiskAlert,
    Attendance,
    Behavioral,
    Academic,
    Crisis,
}

impl EscalationType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "risk_alert" => Some(Self::RiskAlert),
            "attendance" => Some(Self::Attendance),
            "behavioral" => Some(Self::Behavioral),
            "academic" => Some(Self::Academic),
            "crisis" => Some(Self::Crisis),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RiskAlert => "risk_alert",
            Self::Attendance => "attendance",
            Self::Behavioral => "behavioral",
            Self::Academic => "academic",
            Self::Crisis => "crisis",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationStatus {
    Open,
    InProgress,
    Resolved,
    Closed,
}

impl EscalationStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OPEN" => Some(Self::Open),
            "IN_PROGRESS" => Some(Self::InProgress),
            "RESOLVED" => Some(Self::Resolved),
            "CLOSED" => Some(Self::Closed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::InProgress => "IN_PROGRESS",
            Self::Resolved => "RESOLVED",
            Self::Closed => "CLOSED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved | Self::Closed)
    }
}

/// CRITICAL situations climb all the way to the principal; everything else
/// stops at the assistant principal.
pub fn chain_for(risk: Option<RiskLevel>) -> &'static [&'static str] {
    match risk {
        Some(RiskLevel::Critical) => &CHAIN_CRITICAL,
        _ => &CHAIN_STANDARD,
    }
}

pub fn threshold_hours(risk: Option<RiskLevel>, critical_hours: f64, default_hours: f64) -> f64 {
    match risk {
        Some(RiskLevel::Critical) => critical_hours,
        _ => default_hours,
    }
}

pub fn rung_index(chain: &[&str], current_level: &str) -> Option<usize> {
    chain.iter().position(|r| *r == current_level)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_chain_has_three_rungs_starting_at_counselor() {
        let chain = chain_for(Some(RiskLevel::Critical));
        assert_eq!(chain, &[ROLE_COUNSELOR, ROLE_ASSISTANT_PRINCIPAL, ROLE_PRINCIPAL]);
    }

    #[test]
    fn non_critical_chains_have_two_rungs() {
        for risk in [None, Some(RiskLevel::Low), Some(RiskLevel::Moderate), Some(RiskLevel::High)] {
            let chain = chain_for(risk);
            assert_eq!(chain.len(), 2);
            assert_eq!(chain[0], ROLE_COUNSELOR);
        }
    }

    #[test]
    fn thresholds_follow_risk_severity() {
        assert_eq!(threshold_hours(Some(RiskLevel::Critical), 2.0, 24.0), 2.0);
        assert_eq!(threshold_hours(Some(RiskLevel::High), 2.0, 24.0), 24.0);
        assert_eq!(threshold_hours(None, 2.0, 24.0), 24.0);
    }

    #[test]
    fn rung_index_finds_position_or_nothing() {
        let chain = chain_for(Some(RiskLevel::Critical));
        assert_eq!(rung_index(chain, ROLE_COUNSELOR), Some(0));
        assert_eq!(rung_index(chain, ROLE_PRINCIPAL), Some(2));
        assert_eq!(rung_index(chain, "Registrar"), None);
    }

    #[test]
    fn unknown_keys_are_rejected_at_parse() {
        assert_eq!(RiskLevel::parse("SEVERE"), None);
        assert_eq!(EscalationType::parse("other"), None);
        assert_eq!(EscalationStatus::parse("open"), None);
    }
}
