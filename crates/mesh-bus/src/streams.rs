//! # Stream Topology
//!
//! Three fixed streams, provisioned when the bus connects:
//!
//! | Stream   | Subjects                                                    | Retention | Max size |
//! |----------|-------------------------------------------------------------|-----------|----------|
//! | MESSAGES | `workflows.*.*` `agents.*.*` `*.workflows.*.*` `*.agents.*.*` | 168h      | 10GB     |
//! | TOOLS    | `tools.*` `*.tools.*.*`                                     | 720h      | 5GB      |
//! | SYSTEM   | `system.*`                                                  | 24h       | 1GB      |
//!
//! The tenant-prefixed subjects differ from the untenanted ones in token count
//! or in a literal token, so no subject is claimed by two streams.

use std::time::Duration;

use crate::subjects::{Subject, SubjectPattern};

const HOUR: u64 = 60 * 60;
const GIB: u64 = 1024 * 1024 * 1024;

/// Static description of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSpec {
    pub name: &'static str,
    pub subjects: &'static [&'static str],
    pub max_age: Duration,
    pub max_bytes: u64,
}

impl StreamSpec {
    fn patterns(&self) -> impl Iterator<Item = SubjectPattern> + '_ {
        self.subjects
            .iter()
            .filter_map(|s| SubjectPattern::parse(*s).ok())
    }

    pub fn accepts(&self, subject: &Subject) -> bool {
        self.patterns().any(|p| p.matches(subject))
    }

    /// Whether every subject the filter selects is stored in this stream.
    pub fn covers(&self, filter: &SubjectPattern) -> bool {
        self.patterns().any(|p| p.covers(filter))
    }
}

pub const MESSAGES: StreamSpec = StreamSpec {
    name: "MESSAGES",
    subjects: &["workflows.*.*", "agents.*.*", "*.workflows.*.*", "*.agents.*.*"],
    max_age: Duration::from_secs(168 * HOUR),
    max_bytes: 10 * GIB,
};

pub const TOOLS: StreamSpec = StreamSpec {
    name: "TOOLS",
    subjects: &["tools.*", "*.tools.*.*"],
    max_age: Duration::from_secs(720 * HOUR),
    max_bytes: 5 * GIB,
};

pub const SYSTEM: StreamSpec = StreamSpec {
    name: "SYSTEM",
    subjects: &["system.*"],
    max_age: Duration::from_secs(24 * HOUR),
    max_bytes: GIB,
};

/// Stream subjects whose first token is the owning tenant.
pub const TENANT_ROUTES: [&str; 3] = ["*.workflows.*.*", "*.agents.*.*", "*.tools.*.*"];

fn tenant_routes() -> impl Iterator<Item = SubjectPattern> {
    TENANT_ROUTES
        .iter()
        .filter_map(|s| SubjectPattern::parse(*s).ok())
}

/// Whether `subject` is stored under a tenant-prefixed route, whatever its
/// first token looks like.
pub fn is_tenant_route(subject: &Subject) -> bool {
    tenant_routes().any(|p| p.matches(subject))
}

/// Whether every subject `filter` selects lies on a tenant-prefixed route.
pub fn is_tenant_filter(filter: &SubjectPattern) -> bool {
    tenant_routes().any(|p| p.covers(filter))
}

/// All streams, in provisioning order.
pub const TOPOLOGY: [StreamSpec; 3] = [MESSAGES, TOOLS, SYSTEM];

/// Stream that stores `subject`, if any.
pub fn stream_for_subject(subject: &Subject) -> Option<&'static StreamSpec> {
    TOPOLOGY.iter().find(|s| s.accepts(subject))
}

/// Stream whose subjects cover every subject `filter` can select.
pub fn stream_for_filter(filter: &SubjectPattern) -> Option<&'static StreamSpec> {
    TOPOLOGY.iter().find(|s| s.covers(filter))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TENANT: &str = "6f1c2a9e-7d3b-4f0e-9a51-2c8d4e6f7a90";

    fn route(subject: &str) -> Option<&'static str> {
        stream_for_subject(&Subject::parse(subject).unwrap()).map(|s| s.name)
    }

    #[test]
    fn test_subject_routing() {
        assert_eq!(route("workflows.w1.in"), Some("MESSAGES"));
        assert_eq!(route("agents.a1.out"), Some("MESSAGES"));
        assert_eq!(route(&format!("{TENANT}.agents.a1.in")), Some("MESSAGES"));
        assert_eq!(route("tools.calls"), Some("TOOLS"));
        assert_eq!(route(&format!("{TENANT}.tools.search.out")), Some("TOOLS"));
        assert_eq!(route("system.dlq"), Some("SYSTEM"));
        assert_eq!(route("unknown.subject"), None);
        assert_eq!(route("workflows.w1"), None);
    }

    #[test]
    fn test_no_subject_claimed_twice() {
        let samples = [
            "workflows.a.b".to_string(),
            "agents.a.b".to_string(),
            "tools.a".to_string(),
            "system.a".to_string(),
            format!("{TENANT}.workflows.a.in"),
            format!("{TENANT}.agents.a.in"),
            format!("{TENANT}.tools.a.in"),
        ];
        for sample in samples {
            let subject = Subject::parse(sample.as_str()).unwrap();
            let owners = TOPOLOGY.iter().filter(|s| s.accepts(&subject)).count();
            assert_eq!(owners, 1, "{sample} owned by {owners} streams");
        }
    }

    #[test]
    fn test_filter_routing() {
        let filter = SubjectPattern::parse("workflows.w1.*").unwrap();
        assert_eq!(stream_for_filter(&filter).map(|s| s.name), Some("MESSAGES"));

        let filter = SubjectPattern::parse(format!("{TENANT}.tools.*.in")).unwrap();
        assert_eq!(stream_for_filter(&filter).map(|s| s.name), Some("TOOLS"));

        // Spans two streams
        let filter = SubjectPattern::parse(">").unwrap();
        assert!(stream_for_filter(&filter).is_none());
    }

    #[test]
    fn test_tenant_routes() {
        let tenant_routed = |raw: &str| is_tenant_route(&Subject::parse(raw).unwrap());
        assert!(tenant_routed(&format!("{TENANT}.agents.a1.in")));
        assert!(tenant_routed("notatenant.agents.a1.in"));
        assert!(tenant_routed("x.tools.search.out"));
        assert!(!tenant_routed("agents.a1.in"));
        assert!(!tenant_routed("system.dlq"));

        let tenant_filter = |raw: &str| is_tenant_filter(&SubjectPattern::parse(raw).unwrap());
        assert!(tenant_filter("*.agents.*.in"));
        assert!(tenant_filter("notatenant.workflows.*.*"));
        assert!(!tenant_filter("agents.*.in"));

        for route in TENANT_ROUTES {
            assert!(TOPOLOGY.iter().any(|s| s.subjects.contains(&route)), "{route}");
        }
    }

    #[test]
    fn test_retention_limits() {
        assert_eq!(MESSAGES.max_age, Duration::from_secs(168 * 3600));
        assert_eq!(TOOLS.max_bytes, 5 * 1024 * 1024 * 1024);
        assert_eq!(SYSTEM.max_age, Duration::from_secs(24 * 3600));
    }
}
