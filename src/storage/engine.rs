#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageEngine {
    Sled,
}

impl StorageEngine {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "sled" => Some(Self::Sled),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sled => "sled",
        }
    }
}
