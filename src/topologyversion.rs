use std::cmp::Ordering;
use std::fmt::Display;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessId(String);

impl ProcessId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn value(&self) -> &str {
        &self.0
    }
}

impl Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A per-process logical clock reported by a node.
///
/// Two versions are only comparable when both are present and share the same
/// process id. Anything else is treated as "incomparable", which compares as
/// `Less`: the left side is considered staler and never fresher, so an update
/// carrying an incomparable version is always allowed through.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopologyVersion {
    pub process_id: ProcessId,
    pub counter: i64,
}

impl TopologyVersion {
    pub fn new(process_id: ProcessId, counter: i64) -> Self {
        Self {
            process_id,
            counter,
        }
    }

    pub fn compare(x: Option<&TopologyVersion>, y: Option<&TopologyVersion>) -> Ordering {
        match (x, y) {
            (Some(x), Some(y)) if x.process_id == y.process_id => x.counter.cmp(&y.counter),
            _ => Ordering::Less,
        }
    }

    pub fn is_fresher_than(x: Option<&TopologyVersion>, y: Option<&TopologyVersion>) -> bool {
        Self::compare(x, y) == Ordering::Greater
    }

    pub fn is_fresher_than_or_equal_to(
        x: Option<&TopologyVersion>,
        y: Option<&TopologyVersion>,
    ) -> bool {
        Self::compare(x, y) != Ordering::Less
    }

    pub fn is_staler_than(x: Option<&TopologyVersion>, y: Option<&TopologyVersion>) -> bool {
        Self::compare(x, y) == Ordering::Less
    }

    pub fn is_staler_than_or_equal_to(
        x: Option<&TopologyVersion>,
        y: Option<&TopologyVersion>,
    ) -> bool {
        Self::compare(x, y) != Ordering::Greater
    }
}

impl Display for TopologyVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{ processId: {}, counter: {} }}",
            self.process_id, self.counter
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tv(pid: &str, counter: i64) -> TopologyVersion {
        TopologyVersion::new(ProcessId::new(pid), counter)
    }

    #[test]
    fn same_process_compares_by_counter() {
        let a = tv("p1", 1);
        let b = tv("p1", 2);

        assert!(TopologyVersion::is_fresher_than(Some(&b), Some(&a)));
        assert!(TopologyVersion::is_staler_than(Some(&a), Some(&b)));
        assert!(TopologyVersion::is_fresher_than_or_equal_to(Some(&a), Some(&a)));
        assert!(TopologyVersion::is_staler_than_or_equal_to(Some(&a), Some(&a)));
        assert!(!TopologyVersion::is_fresher_than_or_equal_to(Some(&a), Some(&b)));
    }

    #[test]
    fn different_process_is_incomparable() {
        let a = tv("p1", 10);
        let b = tv("p2", 1);

        assert!(TopologyVersion::is_staler_than_or_equal_to(Some(&a), Some(&b)));
        assert!(TopologyVersion::is_staler_than_or_equal_to(Some(&b), Some(&a)));
        assert!(!TopologyVersion::is_fresher_than_or_equal_to(Some(&a), Some(&b)));
        assert!(!TopologyVersion::is_fresher_than_or_equal_to(Some(&b), Some(&a)));
    }

    #[test]
    fn missing_version_is_incomparable() {
        let a = tv("p1", 1);

        assert!(TopologyVersion::is_staler_than(None, Some(&a)));
        assert!(TopologyVersion::is_staler_than(Some(&a), None));
        assert!(TopologyVersion::is_staler_than(None, None));
        assert!(!TopologyVersion::is_fresher_than_or_equal_to(None, None));
    }
}
