//! The persisted state of a training program.

use serde::{
    de::{self, DeserializeOwned, Deserializer},
    ser::{self, Serializer},
    Deserialize,
    Serialize,
};

use crate::data_source::FederatedDataSourceIterator;

#[derive(Clone, Debug, PartialEq)]
/// The state of a training program after a round.
///
/// The data iterator is serialized as its [`to_bytes`](FederatedDataSourceIterator::to_bytes)
/// blob.
pub struct ProgramState<S, I> {
    /// The state of the learning process.
    pub state: S,
    /// The last completed round, `0` before the first round.
    pub round_number: u64,
    /// The time in seconds since the epoch after which the next evaluation is due, if an
    /// evaluation is scheduled by time.
    pub next_evaluation_timestamp_seconds: Option<i64>,
    pub data_iterator: I,
}

impl<S, I> ProgramState<S, I> {
    /// Creates the state of a program before its first round.
    pub fn new(state: S, data_iterator: I) -> Self {
        Self {
            state,
            round_number: 0,
            next_evaluation_timestamp_seconds: Some(0),
            data_iterator,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Persisted<S> {
    state: S,
    round_number: u64,
    next_evaluation_timestamp_seconds: Option<i64>,
    data_iterator: Vec<u8>,
}

impl<S, I> Serialize for ProgramState<S, I>
where
    S: Serialize,
    I: FederatedDataSourceIterator,
{
    fn serialize<Ser: Serializer>(&self, serializer: Ser) -> Result<Ser::Ok, Ser::Error> {
        let data_iterator = self.data_iterator.to_bytes().map_err(ser::Error::custom)?;
        Persisted {
            state: &self.state,
            round_number: self.round_number,
            next_evaluation_timestamp_seconds: self.next_evaluation_timestamp_seconds,
            data_iterator,
        }
        .serialize(serializer)
    }
}

impl<'de, S, I> Deserialize<'de> for ProgramState<S, I>
where
    S: DeserializeOwned,
    I: FederatedDataSourceIterator,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let persisted = Persisted::<S>::deserialize(deserializer)?;
        let data_iterator = I::from_bytes(&persisted.data_iterator).map_err(de::Error::custom)?;
        Ok(Self {
            state: persisted.state,
            round_number: persisted.round_number,
            next_evaluation_timestamp_seconds: persisted.next_evaluation_timestamp_seconds,
            data_iterator,
        })
    }
}

#[cfg(test)]
mod tests {
    use fedcomp_core::{types::DType, Type, Value};

    use super::*;
    use crate::data_source::{ClientDataSource, ClientDataSourceIterator, FederatedDataSource};

    #[test]
    fn test_persisted_state_resumes_the_iterator() {
        let source =
            ClientDataSource::new((0..8).map(Value::from).collect(), Type::scalar(DType::I32), 7)
                .unwrap();
        let mut program_state =
            ProgramState::new(Value::at_server(Value::from(1.5_f32)), source.iterator());
        program_state.round_number = 3;
        program_state.data_iterator.select(2).unwrap();

        let bytes = bincode::serialize(&program_state).unwrap();
        let mut restored: ProgramState<Value, ClientDataSourceIterator> =
            bincode::deserialize(&bytes).unwrap();

        assert_eq!(restored.state, program_state.state);
        assert_eq!(restored.round_number, 3);
        assert_eq!(restored.next_evaluation_timestamp_seconds, Some(0));
        assert_eq!(
            restored.data_iterator.select(3).unwrap(),
            program_state.data_iterator.select(3).unwrap()
        );
    }
}
