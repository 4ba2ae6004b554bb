//! Per-round response and usage accounting.

use serde::{Deserialize, Serialize};

use crate::message::Msg;

/// One round's worth of model output: which model responded, what it cost,
/// and the messages it produced in emission order (reasoning blocks, then
/// assistant content or tool calls).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    pub model: String,
    pub usage: Usage,
    pub messages: Vec<Msg>,
}

/// Token and cost counters for a round or a session.
///
/// `cost` is an integer in units of 10⁻⁹ USD: a value of one billion equals
/// one dollar. Reasoning tokens are billed inside `output` for the
/// providers supported, so `total` is input + output (and is recomputed as
/// input + cached + output when loading persisted usage).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input: i64,
    pub cached: i64,
    pub output: i64,
    pub reasoning: i64,
    pub total: i64,
    pub cost: i64,
}

impl Usage {
    /// Accumulate another usage record into this one, in place.
    pub fn accumulate(&mut self, other: Usage) {
        self.input += other.input;
        self.cached += other.cached;
        self.output += other.output;
        self.reasoning += other.reasoning;
        self.total += other.total;
        self.cost += other.cost;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulate_sums_every_counter() {
        let mut u = Usage {
            input: 1024,
            cached: 0,
            output: 256,
            reasoning: 128,
            total: 1280,
            cost: 500,
        };
        u.accumulate(Usage {
            input: 1280,
            cached: 1024,
            output: 64,
            reasoning: 0,
            total: 1344,
            cost: 100,
        });
        assert_eq!(u.input, 2304);
        assert_eq!(u.cached, 1024);
        assert_eq!(u.output, 320);
        assert_eq!(u.reasoning, 128);
        assert_eq!(u.total, 2624);
        assert_eq!(u.cost, 600);
    }

    #[test]
    fn accumulate_from_zero_is_identity() {
        let mut u = Usage::default();
        let other = Usage {
            input: 10,
            output: 5,
            total: 15,
            ..Usage::default()
        };
        u.accumulate(other);
        assert_eq!(u, other);
    }
}
