//! Threshold evaluation over incoming votes
//!
//! A [`Ballot`] is fed votes as they arrive and can tell, before every vote
//! is in, whether the outcome is already fixed either way.

use crate::consensus::types::{Vote, VoteChoice, VoteTally};

const EPSILON: f64 = 1e-9;

/// What the threshold is measured against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denominator {
    /// Votes cast for some value; abstentions and missing votes excluded
    NonAbstaining,
    /// Total weight of every participant
    TotalWeight,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TallyOutcome {
    Decided(String),
    /// More votes could still change the result
    Pending,
    /// No value can reach the threshold
    Impossible(String),
}

#[derive(Debug, Clone)]
pub struct Ballot {
    threshold: f64,
    denominator: Denominator,
    total_weight: f64,
    outstanding: f64,
    tally: VoteTally,
}

impl Ballot {
    pub fn new(threshold: f64, denominator: Denominator, total_weight: f64) -> Self {
        Self {
            threshold,
            denominator,
            total_weight,
            outstanding: total_weight,
            tally: VoteTally::default(),
        }
    }

    pub fn record(&mut self, vote: &Vote) {
        self.outstanding = (self.outstanding - vote.weight).max(0.0);
        match &vote.choice {
            VoteChoice::Value(value) => {
                *self.tally.counts.entry(value.clone()).or_insert(0.0) += vote.weight;
            }
            VoteChoice::Abstain => self.tally.abstentions += 1,
        }
    }

    /// A participant that will never answer
    pub fn record_missing(&mut self, weight: f64) {
        self.outstanding = (self.outstanding - weight).max(0.0);
        self.tally.missing += 1;
    }

    pub fn tally(&self) -> &VoteTally {
        &self.tally
    }

    pub fn into_tally(self) -> VoteTally {
        self.tally
    }

    fn counted(&self) -> f64 {
        self.tally.counts.values().sum()
    }

    fn reaches(&self, weight: f64, denominator: f64) -> bool {
        denominator > EPSILON && weight >= self.threshold * denominator - EPSILON
    }

    /// Evaluate the ballot; `closed` means no further votes will arrive
    pub fn evaluate(&mut self, closed: bool) -> TallyOutcome {
        let counted = self.counted();
        let current = match self.denominator {
            Denominator::NonAbstaining => counted,
            Denominator::TotalWeight => self.total_weight,
        };
        self.tally.denominator = current;

        if closed || self.outstanding <= EPSILON {
            return self.final_outcome(current);
        }

        // Worst case for a leader: every outstanding vote goes elsewhere
        let widest = match self.denominator {
            Denominator::NonAbstaining => counted + self.outstanding,
            Denominator::TotalWeight => self.total_weight,
        };
        // Above one half, two values cannot both reach the threshold
        if self.threshold > 0.5 {
            if let Some((value, _)) = self
                .tally
                .counts
                .iter()
                .find(|(_, weight)| self.reaches(**weight, widest))
            {
                return TallyOutcome::Decided(value.clone());
            }
        }

        // Best case for any value: every outstanding vote goes to it
        let reachable = self
            .tally
            .counts
            .values()
            .any(|weight| self.reaches(weight + self.outstanding, widest))
            || self.reaches(self.outstanding, widest);
        if !reachable {
            return TallyOutcome::Impossible(format!(
                "no value can reach threshold {} with {:.2} weight outstanding",
                self.threshold, self.outstanding
            ));
        }
        TallyOutcome::Pending
    }

    fn final_outcome(&self, denominator: f64) -> TallyOutcome {
        if denominator <= EPSILON {
            return TallyOutcome::Impossible(match self.denominator {
                Denominator::NonAbstaining => "every participant abstained".to_string(),
                Denominator::TotalWeight => "total participant weight is zero".to_string(),
            });
        }
        let winners: Vec<&String> = self
            .tally
            .counts
            .iter()
            .filter(|(_, weight)| self.reaches(**weight, denominator))
            .map(|(value, _)| value)
            .collect();
        match winners.as_slice() {
            [winner] => TallyOutcome::Decided((*winner).clone()),
            [] => TallyOutcome::Impossible(format!(
                "no value reached threshold {}",
                self.threshold
            )),
            _ => TallyOutcome::Impossible(format!(
                "{} values reached threshold {}",
                winners.len(),
                self.threshold
            )),
        }
    }
}
