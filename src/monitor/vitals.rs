use serde::{Deserialize, Serialize};

/// The Web Vitals this crate understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Vital {
    /// Largest Contentful Paint, milliseconds.
    Lcp,
    /// First Contentful Paint, milliseconds.
    Fcp,
    /// Cumulative Layout Shift, unitless.
    Cls,
    /// Time To First Byte, milliseconds.
    Ttfb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Rating {
    Good,
    NeedsImprovement,
    Poor,
}

impl Vital {
    pub const ALL: [Vital; 4] = [Vital::Lcp, Vital::Fcp, Vital::Cls, Vital::Ttfb];

    /// Upper bound of "good" and lower bound of "poor".
    pub fn thresholds(self) -> (f64, f64) {
        match self {
            Vital::Lcp => (2500.0, 4000.0),
            Vital::Fcp => (1800.0, 3000.0),
            Vital::Cls => (0.1, 0.25),
            Vital::Ttfb => (800.0, 1800.0),
        }
    }

    pub fn rate(self, value: f64) -> Rating {
        let (good, poor) = self.thresholds();
        if value <= good {
            Rating::Good
        } else if value <= poor {
            Rating::NeedsImprovement
        } else {
            Rating::Poor
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Vital::Lcp => "LCP",
            Vital::Fcp => "FCP",
            Vital::Cls => "CLS",
            Vital::Ttfb => "TTFB",
        }
    }
}

impl std::fmt::Display for Vital {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VitalReport {
    pub vital: Vital,
    pub value: f64,
    pub rating: Rating,
}

impl VitalReport {
    pub fn new(vital: Vital, value: f64) -> Self {
        Self {
            vital,
            value,
            rating: vital.rate(value),
        }
    }
}

/// The latest value seen for each vital. Vitals arrive independently, so
/// any of them may still be missing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WebVitals {
    pub lcp: Option<VitalReport>,
    pub fcp: Option<VitalReport>,
    pub cls: Option<VitalReport>,
    pub ttfb: Option<VitalReport>,
}

impl WebVitals {
    pub fn record(&mut self, report: VitalReport) {
        *self.slot(report.vital) = Some(report);
    }

    pub fn get(&self, vital: Vital) -> Option<VitalReport> {
        match vital {
            Vital::Lcp => self.lcp,
            Vital::Fcp => self.fcp,
            Vital::Cls => self.cls,
            Vital::Ttfb => self.ttfb,
        }
    }

    fn slot(&mut self, vital: Vital) -> &mut Option<VitalReport> {
        match vital {
            Vital::Lcp => &mut self.lcp,
            Vital::Fcp => &mut self.fcp,
            Vital::Cls => &mut self.cls,
            Vital::Ttfb => &mut self.ttfb,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = VitalReport> + '_ {
        Vital::ALL.into_iter().filter_map(|vital| self.get(vital))
    }

    /// The worst rating among the vitals reported so far.
    pub fn worst(&self) -> Option<Rating> {
        self.iter().map(|report| report.rating).max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ratings_at_boundaries() {
        assert_eq!(Vital::Lcp.rate(2500.0), Rating::Good);
        assert_eq!(Vital::Lcp.rate(2501.0), Rating::NeedsImprovement);
        assert_eq!(Vital::Lcp.rate(4001.0), Rating::Poor);
        assert_eq!(Vital::Cls.rate(0.05), Rating::Good);
        assert_eq!(Vital::Cls.rate(0.3), Rating::Poor);
        assert_eq!(Vital::Ttfb.rate(1000.0), Rating::NeedsImprovement);
        assert_eq!(Vital::Fcp.rate(3000.0), Rating::NeedsImprovement);
    }

    #[test]
    fn test_vitals_arrive_independently() {
        let mut vitals = WebVitals::default();
        assert_eq!(vitals.worst(), None);

        vitals.record(VitalReport::new(Vital::Ttfb, 200.0));
        vitals.record(VitalReport::new(Vital::Cls, 0.4));
        assert!(vitals.lcp.is_none());
        assert_eq!(vitals.iter().count(), 2);
        assert_eq!(vitals.worst(), Some(Rating::Poor));

        vitals.record(VitalReport::new(Vital::Cls, 0.01));
        assert_eq!(vitals.worst(), Some(Rating::Good));
    }

    #[test]
    fn test_serialized_names() {
        let json = serde_json::to_string(&VitalReport::new(Vital::Lcp, 5000.0)).unwrap();
        assert_eq!(json, r#"{"vital":"LCP","value":5000.0,"rating":"poor"}"#);
    }
}
