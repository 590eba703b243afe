/// A physical backup destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Location {
    pub id: i64,
    pub name: String,
    pub endpoint: Option<String>,
    /// Disabled locations keep their existing copies but receive no new ones.
    pub writes_enabled: bool,
}
