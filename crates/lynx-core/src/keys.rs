pub const EMERGENCY_STOP: &str = "autonomy.emergencyStop";
pub const AUTONOMOUS_ENABLED: &str = "agents.autonomousEnabled";
pub const MAX_CONCURRENCY: &str = "agents.maxConcurrency";
pub const REPLAY_BUDGET_PER_5M: &str = "budget.replay.per5m";

pub const DEGRADED_MAX_CONCURRENCY: u64 = 10;
pub const DEGRADED_REPLAY_BUDGET_PER_5M: u64 = 1;

pub const PORTALS: [&str; 20] = [
    "superAdmin",
    "admin",
    "tmsAdmin",
    "onboarding",
    "broker",
    "shipper",
    "carrier",
    "driver",
    "ownerOperator",
    "factoring",
    "loadBoard",
    "crm",
    "financials",
    "edi",
    "marketplace",
    "analytics",
    "autonomousAi",
    "workers",
    "rates",
    "directory",
];

pub const WEBSITE_AREAS: [&str; 5] = ["marketing", "pricing", "blog", "docs", "careers"];

/// Per-portal and per-website autonomy switches flipped off by an emergency stop.
#[must_use]
pub fn autonomy_feature_keys() -> Vec<String> {
    PORTALS
        .iter()
        .map(|portal| format!("portal.{portal}.autonomous"))
        .chain(WEBSITE_AREAS.iter().map(|area| format!("website.{area}.autonomous")))
        .collect()
}

#[must_use]
pub fn status_keys() -> Vec<&'static str> {
    vec![EMERGENCY_STOP, AUTONOMOUS_ENABLED, MAX_CONCURRENCY, REPLAY_BUDGET_PER_5M]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_keys_cover_portals_and_website() {
        let keys = autonomy_feature_keys();
        assert_eq!(keys.len(), 25);
        assert!(keys.contains(&"portal.carrier.autonomous".to_string()));
        assert!(keys.contains(&"website.docs.autonomous".to_string()));
    }
}
