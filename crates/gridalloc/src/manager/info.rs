use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum ManagerType {
    Sge,
    Slurm,
    Pbs,
}

impl Display for ManagerType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ManagerType::Sge => f.write_str("SGE"),
            ManagerType::Slurm => f.write_str("SLURM"),
            ManagerType::Pbs => f.write_str("PBS"),
        }
    }
}
