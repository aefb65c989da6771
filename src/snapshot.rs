use std::io::{Read, Write};

use bincode::{Decode, Encode};

use crate::errors::{Result, SsvmError};
use crate::latent::{LatentCrf, LatentCrfConfig};
use crate::model::StructuredModel;

/// Trained latent model: hyper-parameters and weights.
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct Snapshot {
    /// Hyper-parameters of the model.
    pub model: LatentCrfConfig,

    /// Learned weights.
    pub weights: Vec<f64>,
}

impl Snapshot {
    /// Serializes the snapshot and returns the number of written bytes.
    ///
    /// # Errors
    ///
    /// [`SsvmError::Persistence`] is returned when encoding or writing fails.
    pub fn write<W: Write>(&self, mut wtr: W) -> Result<usize> {
        Ok(bincode::encode_into_std_write(
            self,
            &mut wtr,
            bincode::config::standard(),
        )?)
    }

    /// Deserializes a snapshot.
    ///
    /// # Errors
    ///
    /// [`SsvmError::Persistence`] is returned when reading or decoding fails.
    pub fn read<R: Read>(mut rdr: R) -> Result<Self> {
        Ok(bincode::decode_from_std_read(
            &mut rdr,
            bincode::config::standard(),
        )?)
    }

    /// Rebuilds the model and returns it with the weights.
    ///
    /// # Errors
    ///
    /// [`SsvmError::Modeling`] is returned when the hyper-parameters are
    /// invalid and [`SsvmError::Persistence`] when the weights do not fit the
    /// model.
    pub fn restore(self) -> Result<(LatentCrf, Vec<f64>)> {
        let model = LatentCrf::from_config(&self.model)?;
        if self.weights.len() != model.size_joint_feature() {
            return Err(SsvmError::persistence(format!(
                "snapshot has {} weights, the model needs {}",
                self.weights.len(),
                model.size_joint_feature()
            )));
        }
        Ok((model, self.weights))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::grid::Neighborhood;
    use crate::inference::InferenceMethod;
    use crate::latent_ssvm::LatentSsvm;
    use crate::learners::{BaseSvm, SsvmConfig};
    use crate::test_utils;

    #[test]
    fn test_restore_predicts_the_same() {
        let (xs, ys) = test_utils::generate_crosses(3, 6, 0.2, 5);
        let crf = LatentCrf::grid(2, 2, InferenceMethod::MaxProduct)
            .unwrap()
            .neighborhood(Neighborhood::Eight);
        let mut ssvm = LatentSsvm::new(crf, BaseSvm::OneSlack, SsvmConfig::new())
            .latent_iter(2)
            .unwrap();
        ssvm.fit(&xs, &ys, None).unwrap();

        let mut buffer = vec![];
        let n_bytes = ssvm.snapshot().write(&mut buffer).unwrap();
        assert_eq!(buffer.len(), n_bytes);

        let snapshot = Snapshot::read(buffer.as_slice()).unwrap();
        assert_eq!(ssvm.snapshot(), snapshot);
        let (model, weights) = snapshot.restore().unwrap();
        for (x, y_hat) in xs.iter().zip(ssvm.predict(&xs).unwrap()) {
            let h = model.inference(x, &weights).unwrap();
            assert_eq!(y_hat, model.collapse(&h));
        }
    }

    #[test]
    fn test_read_errors() {
        assert!(matches!(
            Snapshot::read([0xffu8, 0xff].as_slice()),
            Err(SsvmError::Persistence(_))
        ));
    }

    #[test]
    fn test_restore_errors() {
        let crf = LatentCrf::grid(2, 2, InferenceMethod::Icm).unwrap();
        let snapshot = Snapshot {
            model: crf.config(),
            weights: vec![0.0; 3],
        };
        assert!(matches!(
            snapshot.restore(),
            Err(SsvmError::Persistence(_))
        ));
        let snapshot = Snapshot {
            model: LatentCrfConfig {
                states_per_label: vec![2, 0],
                ..crf.config()
            },
            weights: vec![],
        };
        assert!(matches!(snapshot.restore(), Err(SsvmError::Modeling(_))));
    }
}
