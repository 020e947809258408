use std::fmt;

use serde::{Deserialize, Serialize};

use crate::data::{Covariates, DosageRegimen};

/// A recorded sample of a named analyte
///
/// Samples are not used by the forward simulation, apart from their times, which serve as
/// default output times.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Sample {
    time: f64,
    analyte: String,
    value: Option<f64>,
}

impl Sample {
    pub fn new(time: f64, analyte: impl Into<String>, value: Option<f64>) -> Self {
        Sample {
            time,
            analyte: analyte.into(),
            value,
        }
    }
    pub fn time(&self) -> f64 {
        self.time
    }
    pub fn analyte(&self) -> &str {
        &self.analyte
    }
    /// The observed value, `None` for a sample requested without a measurement
    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// A single individual
///
/// A [Subject] carries its dosage regimen, its covariates and any recorded samples.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Subject {
    id: String,
    regimen: DosageRegimen,
    covariates: Covariates,
    samples: Vec<Sample>,
}

impl Subject {
    /// Create a new subject
    ///
    /// # Arguments
    ///
    /// * `id` - The subject identifier
    /// * `regimen` - The dosage regimen, possibly empty
    /// * `covariates` - Time-invariant or time-varying covariates
    pub fn new(id: impl Into<String>, regimen: DosageRegimen, covariates: Covariates) -> Self {
        Subject {
            id: id.into(),
            regimen,
            covariates,
            samples: Vec::new(),
        }
    }

    pub fn with_samples(mut self, mut samples: Vec<Sample>) -> Self {
        samples.sort_by(|a, b| a.time.total_cmp(&b.time));
        self.samples = samples;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn regimen(&self) -> &DosageRegimen {
        &self.regimen
    }

    pub fn covariates(&self) -> &Covariates {
        &self.covariates
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Distinct sample times in increasing order
    pub fn sample_times(&self) -> Vec<f64> {
        let mut times: Vec<f64> = self.samples.iter().map(|s| s.time).collect();
        times.dedup();
        times
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Subject: {}", self.id)?;
        write!(f, "{}", self.regimen)?;
        if !self.covariates.is_empty() {
            write!(f, "{}", self.covariates)?;
        }
        writeln!(f, "Samples: {}", self.samples.len())
    }
}

/// An ordered collection of [Subject]s simulated with the same model
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Population {
    subjects: Vec<Subject>,
}

impl Population {
    /// Constructs a new [Population] object from a vector of [Subject]s
    pub fn new(subjects: Vec<Subject>) -> Self {
        Population { subjects }
    }

    pub fn subjects(&self) -> &[Subject] {
        &self.subjects
    }

    pub fn add_subject(&mut self, subject: Subject) {
        self.subjects.push(subject);
    }

    /// Get a subject by its ID
    pub fn get_subject(&self, id: &str) -> Option<&Subject> {
        self.subjects.iter().find(|s| s.id == id)
    }

    /// A new population with only the subjects listed in `include`, in their original order
    pub fn filter_include(&self, include: &[String]) -> Population {
        Population::new(
            self.subjects
                .iter()
                .filter(|s| include.contains(&s.id))
                .cloned()
                .collect(),
        )
    }

    /// A new population without the subjects listed in `exclude`
    pub fn filter_exclude(&self, exclude: &[String]) -> Population {
        Population::new(
            self.subjects
                .iter()
                .filter(|s| !exclude.contains(&s.id))
                .cloned()
                .collect(),
        )
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Subject> {
        self.subjects.iter()
    }

    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }
}

impl IntoIterator for Population {
    type Item = Subject;
    type IntoIter = std::vec::IntoIter<Subject>;

    fn into_iter(self) -> Self::IntoIter {
        self.subjects.into_iter()
    }
}

impl<'a> IntoIterator for &'a Population {
    type Item = &'a Subject;
    type IntoIter = std::slice::Iter<'a, Subject>;

    fn into_iter(self) -> Self::IntoIter {
        self.subjects.iter()
    }
}

impl From<Vec<Subject>> for Population {
    fn from(subjects: Vec<Subject>) -> Self {
        Population::new(subjects)
    }
}

impl FromIterator<Subject> for Population {
    fn from_iter<I: IntoIterator<Item = Subject>>(iter: I) -> Self {
        Population::new(iter.into_iter().collect())
    }
}

impl fmt::Display for Population {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Population ({} subjects)", self.subjects.len())?;
        for subject in &self.subjects {
            write!(f, "{}", subject)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Dose;

    fn population() -> Population {
        (1..=4)
            .map(|i| {
                Subject::new(
                    i.to_string(),
                    DosageRegimen::from(vec![Dose::bolus(0.0, 100.0 * i as f64, 0)]),
                    Covariates::new(),
                )
            })
            .collect()
    }

    #[test]
    fn lookup_and_filters() {
        let population = population();
        assert_eq!(population.len(), 4);
        assert_eq!(
            population.get_subject("3").map(|s| s.regimen().doses()[0].amount()),
            Some(300.0)
        );

        let included = population.filter_include(&["4".to_string(), "2".to_string()]);
        let ids: Vec<&str> = included.iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec!["2", "4"]);

        let excluded = population.filter_exclude(&["1".to_string()]);
        assert_eq!(excluded.len(), 3);
        assert!(excluded.get_subject("1").is_none());
    }

    #[test]
    fn sample_times_are_sorted() {
        let subject = Subject::new("a", DosageRegimen::new(), Covariates::new()).with_samples(vec![
            Sample::new(4.0, "cp", Some(1.0)),
            Sample::new(1.0, "cp", None),
            Sample::new(4.0, "effect", None),
        ]);
        assert_eq!(subject.sample_times(), vec![1.0, 4.0]);
    }
}
