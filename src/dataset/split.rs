use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use serde::{Deserialize, Serialize};

use super::DatasetError;

/// Patients assigned to training and testing. Slices of one patient never
/// end up on both sides.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientSplit {
    pub train: Vec<String>,
    pub test: Vec<String>,
}

/// Shuffle `patients` with `seed` and put `train_fraction` of them in the
/// training set, keeping at least one patient on each side.
pub fn split_patients(
    patients: &[String],
    train_fraction: f64,
    seed: u64,
) -> Result<PatientSplit, DatasetError> {
    if !(train_fraction > 0.0 && train_fraction < 1.0) {
        return Err(DatasetError::InvalidFraction(train_fraction));
    }
    if patients.len() < 2 {
        return Err(DatasetError::NotEnoughPatients(patients.len()));
    }

    let mut shuffled = patients.to_vec();
    shuffled.sort();
    shuffled.shuffle(&mut StdRng::seed_from_u64(seed));

    let n_train = ((patients.len() as f64 * train_fraction).round() as usize)
        .clamp(1, patients.len() - 1);
    let test = shuffled.split_off(n_train);

    tracing::info!(
        "Split {} patients into {} for training and {} for testing",
        patients.len(),
        shuffled.len(),
        test.len()
    );

    Ok(PatientSplit {
        train: shuffled,
        test,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patients(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("patient_{i:03}")).collect()
    }

    #[test]
    fn split_is_disjoint_and_complete() {
        let patients = patients(10);

        let split = split_patients(&patients, 0.7, 42).unwrap();

        assert_eq!(split.train.len(), 7);
        assert_eq!(split.test.len(), 3);
        let mut all: Vec<String> = split.train.iter().chain(&split.test).cloned().collect();
        all.sort();
        assert_eq!(all, patients);
    }

    #[test]
    fn split_is_reproducible_and_order_independent() {
        let patients = patients(20);
        let mut reversed = patients.clone();
        reversed.reverse();

        let first = split_patients(&patients, 0.5, 7).unwrap();
        let second = split_patients(&reversed, 0.5, 7).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn both_sides_are_never_empty() {
        let split = split_patients(&patients(2), 0.99, 1).unwrap();
        assert_eq!((split.train.len(), split.test.len()), (1, 1));

        let split = split_patients(&patients(3), 0.01, 1).unwrap();
        assert_eq!((split.train.len(), split.test.len()), (1, 2));
    }

    #[test]
    fn rejects_degenerate_inputs() {
        assert!(matches!(
            split_patients(&patients(1), 0.5, 0),
            Err(DatasetError::NotEnoughPatients(1))
        ));
        assert!(matches!(
            split_patients(&patients(4), 1.0, 0),
            Err(DatasetError::InvalidFraction(_))
        ));
    }
}
