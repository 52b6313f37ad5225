//! Register resolution.
//!
//! The target application only exposes one register's keys at a time, and
//! switching costs a key press plus a delay. When a tick has notes in
//! several registers, one register is chosen and only its notes are played.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Strategy for choosing the register of a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterPolicy {
    /// The lowest register among the due notes.
    #[default]
    Lowest,
    /// The highest register among the due notes.
    Highest,
    /// The register holding the most due notes. Ties go to the lowest
    /// register number.
    Most,
}

impl RegisterPolicy {
    /// Chooses a register for the given note registers.
    ///
    /// # Arguments
    ///
    /// * `registers` - Register of every note due this tick
    ///
    /// # Returns
    ///
    /// The chosen register, or `None` if there are no notes
    pub fn resolve(self, registers: impl IntoIterator<Item = i32>) -> Option<i32> {
        let mut registers = registers.into_iter().peekable();
        registers.peek()?;
        match self {
            RegisterPolicy::Lowest => registers.min(),
            RegisterPolicy::Highest => registers.max(),
            RegisterPolicy::Most => {
                let mut counts: BTreeMap<i32, usize> = BTreeMap::new();
                for register in registers {
                    *counts.entry(register).or_default() += 1;
                }
                // BTreeMap iterates ascending; keep the first maximum.
                counts
                    .into_iter()
                    .fold(None, |best: Option<(i32, usize)>, (register, count)| match best {
                        Some((_, best_count)) if best_count >= count => best,
                        _ => Some((register, count)),
                    })
                    .map(|(register, _)| register)
            }
        }
    }

    /// Parses a policy name as used on the command line.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "lowest" => Some(RegisterPolicy::Lowest),
            "highest" => Some(RegisterPolicy::Highest),
            "most" => Some(RegisterPolicy::Most),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policies() {
        let registers = [1, 1, 3];
        assert_eq!(RegisterPolicy::Highest.resolve(registers), Some(3));
        assert_eq!(RegisterPolicy::Lowest.resolve(registers), Some(1));
        assert_eq!(RegisterPolicy::Most.resolve(registers), Some(1));
        assert_eq!(RegisterPolicy::Most.resolve([0, 2, 2, 1]), Some(2));
    }

    #[test]
    fn test_no_notes() {
        for policy in [
            RegisterPolicy::Lowest,
            RegisterPolicy::Highest,
            RegisterPolicy::Most,
        ] {
            assert_eq!(policy.resolve(std::iter::empty()), None);
        }
    }

    #[test]
    fn test_most_tie_goes_low() {
        assert_eq!(RegisterPolicy::Most.resolve([2, 0, 2, 0]), Some(0));
        assert_eq!(RegisterPolicy::Most.resolve([3, 1]), Some(1));
    }

    #[test]
    fn test_from_name() {
        assert_eq!(RegisterPolicy::from_name("Most"), Some(RegisterPolicy::Most));
        assert_eq!(RegisterPolicy::from_name("lowest"), Some(RegisterPolicy::Lowest));
        assert_eq!(RegisterPolicy::from_name("loudest"), None);
    }
}
