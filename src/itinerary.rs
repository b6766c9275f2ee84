use std::fmt::Debug;

use thiserror::Error;

/// Predicate flag bit.
pub type Flag = u8;

/// Evaluates whether a flagged itinerary entry applies to the subject.
/// Evaluation is side-effect free.
pub trait Predicate {
    fn evaluate(&self, flag: Flag) -> bool;
}

/// A named entry in an itinerary, optionally gated by predicate flags.
/// The entry applies when every bit in `all` evaluates true.
#[derive(Debug, Clone, Copy)]
pub struct Entry<P> {
    pub phase: P,
    pub all: Flag,
}

impl<P> Entry<P> {
    fn admissible(&self, predicate: &dyn Predicate) -> bool {
        let mut flag: Flag = 1;
        let mut all = self.all;
        while all != 0 {
            if all & 1 != 0 && !predicate.evaluate(flag) {
                return false;
            }
            all >>= 1;
            flag <<= 1;
        }
        true
    }
}

#[derive(Debug, Error)]
pub enum ItineraryError {
    #[error("phase [{0}] not found in itinerary")]
    PhaseNotFound(String),
}

/// An ordered pipeline of phases with conditional entries.
#[derive(Debug, Clone, Copy)]
pub struct Itinerary<P: 'static> {
    pub pipeline: &'static [Entry<P>],
}

impl<P: Copy + PartialEq + Debug> Itinerary<P> {
    /// The first admissible entry.
    pub fn first(&self, predicate: &dyn Predicate) -> Option<&Entry<P>> {
        self.pipeline.iter().find(|e| e.admissible(predicate))
    }

    /// The next admissible entry after `phase`; `None` when the end of
    /// the pipeline is reached. Fails only when `phase` is not a member
    /// of the pipeline.
    pub fn next(
        &self,
        phase: P,
        predicate: &dyn Predicate,
    ) -> Result<Option<&Entry<P>>, ItineraryError> {
        let index = self
            .pipeline
            .iter()
            .position(|e| e.phase == phase)
            .ok_or_else(|| ItineraryError::PhaseNotFound(format!("{:?}", phase)))?;
        Ok(self.pipeline[index + 1..]
            .iter()
            .find(|e| e.admissible(predicate)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: Flag = 0x01;
    const B: Flag = 0x02;

    struct Flags(Flag);

    impl Predicate for Flags {
        fn evaluate(&self, flag: Flag) -> bool {
            self.0 & flag != 0
        }
    }

    static PIPELINE: Itinerary<&str> = Itinerary {
        pipeline: &[
            Entry { phase: "one", all: 0 },
            Entry { phase: "two", all: A },
            Entry { phase: "three", all: 0 },
            Entry { phase: "four", all: A | B },
            Entry { phase: "five", all: 0 },
        ],
    };

    #[test]
    fn first_skips_gated_entries() {
        static GATED: Itinerary<&str> = Itinerary {
            pipeline: &[Entry { phase: "pre", all: A }, Entry { phase: "main", all: 0 }],
        };
        assert_eq!(GATED.first(&Flags(0)).unwrap().phase, "main");
        assert_eq!(GATED.first(&Flags(A)).unwrap().phase, "pre");
    }

    #[test]
    fn next_honors_flags() {
        let entry = PIPELINE.next("one", &Flags(0)).unwrap().unwrap();
        assert_eq!(entry.phase, "three");
        let entry = PIPELINE.next("one", &Flags(A)).unwrap().unwrap();
        assert_eq!(entry.phase, "two");
        // Entry four needs both bits.
        let entry = PIPELINE.next("three", &Flags(A)).unwrap().unwrap();
        assert_eq!(entry.phase, "five");
        let entry = PIPELINE.next("three", &Flags(A | B)).unwrap().unwrap();
        assert_eq!(entry.phase, "four");
    }

    #[test]
    fn next_reports_done_at_the_end() {
        assert!(PIPELINE.next("five", &Flags(A | B)).unwrap().is_none());
    }

    #[test]
    fn next_fails_on_unknown_phase() {
        assert!(matches!(
            PIPELINE.next("missing", &Flags(0)),
            Err(ItineraryError::PhaseNotFound(_))
        ));
    }
}
