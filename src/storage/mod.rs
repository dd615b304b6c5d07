pub mod local;

use std::fmt;

/// 同步的一侧
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Remote,
    Local,
}

impl Side {
    /// 对侧
    pub fn other(self) -> Side {
        match self {
            Side::Remote => Side::Local,
            Side::Local => Side::Remote,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Side::Remote => "remote",
            Side::Local => "local",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
