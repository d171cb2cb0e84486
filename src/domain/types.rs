use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};

/// One leg of a three-phase connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, EnumIter)]
pub enum Phase {
    L1,
    L2,
    L3,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::L1, Phase::L2, Phase::L3];
}

/// Active or reactive power. The two are dispatched independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumIter)]
#[serde(rename_all = "lowercase")]
pub enum Pwr {
    #[strum(serialize = "P")]
    Active,
    #[strum(serialize = "Q")]
    Reactive,
}

impl Pwr {
    pub fn unit(&self) -> &'static str {
        match self {
            Pwr::Active => "W",
            Pwr::Reactive => "var",
        }
    }
}
