use std::fmt;

use serde::{Deserialize, Serialize};

use crate::data::event::Dose;
use crate::error::PharmsimError;

/// An ordered list of [Dose] records
///
/// Records are kept in nominal time order. Records sharing a time keep the order in which they
/// were added, which is also the order in which coincident administrations are applied.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct DosageRegimen {
    doses: Vec<Dose>,
}

impl DosageRegimen {
    pub fn new() -> Self {
        DosageRegimen::default()
    }

    /// Build a regimen from records in any order
    pub fn from_doses(doses: Vec<Dose>) -> Self {
        let mut regimen = DosageRegimen { doses };
        regimen.sort();
        regimen
    }

    fn sort(&mut self) {
        // stable: ties keep insertion order
        self.doses.sort_by(|a, b| a.time().total_cmp(&b.time()));
    }

    /// Add a record
    pub fn push(&mut self, dose: Dose) {
        let position = self.doses.partition_point(|d| d.time() <= dose.time());
        self.doses.insert(position, dose);
    }

    /// Builder-style [DosageRegimen::push]
    pub fn with(mut self, dose: Dose) -> Self {
        self.push(dose);
        self
    }

    /// Merge two regimens into a new one
    ///
    /// At equal times, records of `self` come before records of `other`.
    pub fn combine(&self, other: &DosageRegimen) -> DosageRegimen {
        let mut doses = self.doses.clone();
        doses.extend(other.doses.iter().cloned());
        DosageRegimen::from_doses(doses)
    }

    /// Merge any number of regimens, in argument order for ties
    pub fn combine_all<'a>(regimens: impl IntoIterator<Item = &'a DosageRegimen>) -> DosageRegimen {
        regimens
            .into_iter()
            .fold(DosageRegimen::new(), |acc, r| acc.combine(r))
    }

    /// A copy of the regimen with every record shifted by `dt`
    pub fn offset(&self, dt: f64) -> DosageRegimen {
        let mut regimen = self.clone();
        regimen.doses.iter_mut().for_each(|d| d.shift(dt));
        regimen
    }

    /// Check every record
    pub fn validate(&self) -> Result<(), PharmsimError> {
        self.doses.iter().try_for_each(Dose::validate)
    }

    pub fn doses(&self) -> &[Dose] {
        &self.doses
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Dose> {
        self.doses.iter()
    }

    pub fn len(&self) -> usize {
        self.doses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doses.is_empty()
    }

    /// Nominal time of the last administration, including additional doses
    pub fn last_nominal_time(&self) -> Option<f64> {
        self.doses
            .iter()
            .map(|d| d.time() + d.addl() as f64 * d.ii())
            .max_by(f64::total_cmp)
    }
}

impl From<Vec<Dose>> for DosageRegimen {
    fn from(doses: Vec<Dose>) -> Self {
        DosageRegimen::from_doses(doses)
    }
}

impl IntoIterator for DosageRegimen {
    type Item = Dose;
    type IntoIter = std::vec::IntoIter<Dose>;

    fn into_iter(self) -> Self::IntoIter {
        self.doses.into_iter()
    }
}

impl<'a> IntoIterator for &'a DosageRegimen {
    type Item = &'a Dose;
    type IntoIter = std::slice::Iter<'a, Dose>;

    fn into_iter(self) -> Self::IntoIter {
        self.doses.iter()
    }
}

impl fmt::Display for DosageRegimen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Dosage regimen ({} records):", self.doses.len())?;
        for dose in &self.doses {
            writeln!(f, "  {}", dose)?;
        }
        Ok(())
    }
}
