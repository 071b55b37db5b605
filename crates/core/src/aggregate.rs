/// Optimistic concurrency expectation for one append.
///
/// An aggregate's version is the number of events committed for it: 0 before
/// its first event, 1 after it.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// No check.
    #[default]
    Any,
    /// The aggregate must not have any events yet.
    NoStream,
    Exact(u64),
}

impl ExpectedVersion {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::NoStream => actual == 0,
            ExpectedVersion::Exact(expected) => expected == actual,
        }
    }
}
