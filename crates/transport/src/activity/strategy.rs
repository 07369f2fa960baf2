//! Reporting strategies
//!
//! A strategy is asked twice: on every recorded activity and at the end of each
//! reporting period. It answers whether the latest unreported activity should
//! be reported now. Strategies keep per-key state, one instance per tracked key.

use devgate_common::config::ActivityReportingStrategy;

pub trait ActivityStrategy: Send + Sync {
    fn on_activity(&mut self) -> bool;

    fn on_reporting_period_end(&mut self) -> bool;
}

/// Build a fresh strategy instance for one key
pub fn new_strategy(kind: ActivityReportingStrategy) -> Box<dyn ActivityStrategy> {
    match kind {
        ActivityReportingStrategy::All => Box::new(AllStrategy),
        ActivityReportingStrategy::First => Box::new(FirstStrategy::default()),
        ActivityReportingStrategy::Last => Box::new(LastStrategy),
        ActivityReportingStrategy::FirstAndLast => Box::new(FirstAndLastStrategy::default()),
    }
}

struct AllStrategy;

impl ActivityStrategy for AllStrategy {
    fn on_activity(&mut self) -> bool {
        true
    }

    fn on_reporting_period_end(&mut self) -> bool {
        true
    }
}

#[derive(Default)]
struct FirstStrategy {
    first_reported: bool,
}

impl ActivityStrategy for FirstStrategy {
    fn on_activity(&mut self) -> bool {
        !std::mem::replace(&mut self.first_reported, true)
    }

    fn on_reporting_period_end(&mut self) -> bool {
        self.first_reported = false;
        false
    }
}

struct LastStrategy;

impl ActivityStrategy for LastStrategy {
    fn on_activity(&mut self) -> bool {
        false
    }

    fn on_reporting_period_end(&mut self) -> bool {
        true
    }
}

#[derive(Default)]
struct FirstAndLastStrategy {
    first_reported: bool,
}

impl ActivityStrategy for FirstAndLastStrategy {
    fn on_activity(&mut self) -> bool {
        !std::mem::replace(&mut self.first_reported, true)
    }

    fn on_reporting_period_end(&mut self) -> bool {
        self.first_reported = false;
        true
    }
}
