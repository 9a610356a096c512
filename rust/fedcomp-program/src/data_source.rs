//! Federated data sources.
//!
//! A [`FederatedDataSource`] hands out [`FederatedDataSourceIterator`]s, which select the data of
//! a number of clients per call. Iterators are persisted with the program state, so the selection
//! continues where it stopped when a training program resumes.

use displaydoc::Display;
use rand::{seq::index::sample, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use fedcomp_core::{Type, Value};

#[derive(Debug, Display, Error)]
/// Errors of data sources.
pub enum DataSourceError {
    /// requested {requested} clients, but only {available} are available
    NotEnoughClients { requested: usize, available: usize },
    /// a client data source needs at least one client
    NoClients,
    /// client data doesn't match {ty}: {reason}
    ClientData { ty: Type, reason: String },
    /// failed to encode the iterator: {0}
    Encoding(#[from] bincode::Error),
}

/// A source of federated data.
pub trait FederatedDataSource: Send + Sync {
    type Iterator: FederatedDataSourceIterator;

    /// Gets the type of the data selected by the iterators.
    fn federated_type(&self) -> &Type;

    /// Creates an iterator starting at the beginning of the source.
    fn iterator(&self) -> Self::Iterator;
}

/// A cursor over a federated data source.
pub trait FederatedDataSourceIterator: Sized + Send + Sync {
    type Data: Send;

    /// Selects the data of `k` clients and advances the cursor.
    fn select(&mut self, k: usize) -> Result<Self::Data, DataSourceError>;

    /// Serializes the iterator, cursor included.
    fn to_bytes(&self) -> Result<Vec<u8>, DataSourceError>;

    /// Restores an iterator serialized by [`to_bytes`](Self::to_bytes). The restored iterator
    /// selects the same data the original one would have selected next.
    fn from_bytes(bytes: &[u8]) -> Result<Self, DataSourceError>;

    fn federated_type(&self) -> &Type;
}

#[derive(Clone, Debug)]
/// A data source over a fixed list of client datasets.
///
/// Every selection picks distinct clients uniformly at random from a seeded stream.
pub struct ClientDataSource {
    datasets: Vec<Value>,
    federated_type: Type,
    seed: u64,
}

impl ClientDataSource {
    /// Creates a data source over `datasets`, each being the data of one client.
    ///
    /// # Errors
    /// Fails if there are no datasets or if a dataset doesn't fit the member type `ty`.
    pub fn new(datasets: Vec<Value>, ty: Type, seed: u64) -> Result<Self, DataSourceError> {
        if datasets.is_empty() {
            return Err(DataSourceError::NoClients);
        }
        for dataset in &datasets {
            ty.check_value(dataset)
                .map_err(|err| DataSourceError::ClientData {
                    ty: ty.clone(),
                    reason: err.to_string(),
                })?;
        }
        Ok(Self {
            datasets,
            federated_type: Type::at_clients(ty),
            seed,
        })
    }

    pub fn num_clients(&self) -> usize {
        self.datasets.len()
    }
}

impl FederatedDataSource for ClientDataSource {
    type Iterator = ClientDataSourceIterator;

    fn federated_type(&self) -> &Type {
        &self.federated_type
    }

    fn iterator(&self) -> Self::Iterator {
        ClientDataSourceIterator {
            datasets: self.datasets.clone(),
            federated_type: self.federated_type.clone(),
            seed: self.seed,
            rng: ChaCha20Rng::seed_from_u64(self.seed),
        }
    }
}

#[derive(Clone, Debug)]
/// The iterator of a [`ClientDataSource`].
pub struct ClientDataSourceIterator {
    datasets: Vec<Value>,
    federated_type: Type,
    seed: u64,
    rng: ChaCha20Rng,
}

#[derive(Serialize, Deserialize)]
struct Cursor {
    datasets: Vec<Value>,
    federated_type: Type,
    seed: u64,
    word_pos: u128,
}

impl FederatedDataSourceIterator for ClientDataSourceIterator {
    type Data = Value;

    fn select(&mut self, k: usize) -> Result<Value, DataSourceError> {
        let available = self.datasets.len();
        if k > available {
            return Err(DataSourceError::NotEnoughClients {
                requested: k,
                available,
            });
        }
        let members = sample(&mut self.rng, available, k)
            .into_iter()
            .map(|index| self.datasets[index].clone())
            .collect();
        Ok(Value::at_clients(members))
    }

    fn to_bytes(&self) -> Result<Vec<u8>, DataSourceError> {
        let cursor = Cursor {
            datasets: self.datasets.clone(),
            federated_type: self.federated_type.clone(),
            seed: self.seed,
            word_pos: self.rng.get_word_pos(),
        };
        Ok(bincode::serialize(&cursor)?)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, DataSourceError> {
        let Cursor {
            datasets,
            federated_type,
            seed,
            word_pos,
        } = bincode::deserialize(bytes)?;
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        rng.set_word_pos(word_pos);
        Ok(Self {
            datasets,
            federated_type,
            seed,
            rng,
        })
    }

    fn federated_type(&self) -> &Type {
        &self.federated_type
    }
}

#[cfg(test)]
mod tests {
    use fedcomp_core::types::DType;

    use super::*;

    fn data_source() -> ClientDataSource {
        let datasets = (0..10).map(Value::from).collect();
        ClientDataSource::new(datasets, Type::scalar(DType::I32), 42).unwrap()
    }

    fn members(value: Value) -> Vec<Value> {
        match value {
            Value::Federated(value) => value.into_members(),
            other => panic!("expected a federated value, found {:?}", other),
        }
    }

    #[test]
    fn test_select_distinct_clients() {
        let mut iterator = data_source().iterator();
        let selected = members(iterator.select(5).unwrap());
        assert_eq!(selected.len(), 5);
        for (i, member) in selected.iter().enumerate() {
            assert!(!selected[i + 1..].contains(member));
        }
        assert_eq!(members(iterator.select(10).unwrap()).len(), 10);
    }

    #[test]
    fn test_select_too_many_clients() {
        assert!(matches!(
            data_source().iterator().select(11),
            Err(DataSourceError::NotEnoughClients {
                requested: 11,
                available: 10
            })
        ));
    }

    #[test]
    fn test_resumed_iterator_continues_the_selection() {
        let mut original = data_source().iterator();
        original.select(3).unwrap();
        let mut restored =
            ClientDataSourceIterator::from_bytes(&original.to_bytes().unwrap()).unwrap();
        for _ in 0..5 {
            assert_eq!(original.select(4).unwrap(), restored.select(4).unwrap());
        }
        assert_eq!(restored.federated_type(), original.federated_type());
    }

    #[test]
    fn test_iterators_start_at_the_beginning() {
        let source = data_source();
        let mut first = source.iterator();
        first.select(2).unwrap();
        assert_eq!(
            source.iterator().select(3).unwrap(),
            data_source().iterator().select(3).unwrap()
        );
    }

    #[test]
    fn test_client_data_must_fit_the_type() {
        assert!(matches!(
            ClientDataSource::new(vec![Value::from(1.0_f32)], Type::scalar(DType::I32), 0),
            Err(DataSourceError::ClientData { .. })
        ));
        assert!(matches!(
            ClientDataSource::new(vec![], Type::scalar(DType::I32), 0),
            Err(DataSourceError::NoClients)
        ));
    }
}
