//! One polling cycle: sequential register acquisition and reading assembly.
//!
//! All-or-nothing: the first register failure aborts the whole cycle and no
//! partial reading is ever handed downstream. This mirrors the backlog's
//! durability contract, which only ever stores complete records.

use chrono::Local;
use tracing::trace;

use crate::config::Config;
use crate::decode::{compute_phase_imbalance, decode_float32};
use crate::error::{DecodeFault, MeterError, Result};
use crate::reading::{Reading, PHASE_CURRENT_FIELDS, REGISTER_FIELDS, TIMESTAMP_FORMAT};
use crate::transport::RegisterSource;

/// Registers per decoded value: one IEEE-754 float spans two words.
const WORDS_PER_VALUE: u16 = 2;

pub struct ReadingCollector {
    /// `(address, field)` in acquisition order.
    register_map: Vec<(u16, &'static str)>,
    meter_id: u8,
}

impl ReadingCollector {
    /// Build from validated configuration (the register list length is
    /// checked against the schema at startup).
    pub fn new(config: &Config) -> Self {
        let register_map = config
            .registers
            .iter()
            .copied()
            .zip(REGISTER_FIELDS)
            .collect();
        Self {
            register_map,
            meter_id: config.meter.id,
        }
    }

    /// Run one acquisition cycle against the device.
    ///
    /// `host_address` is the best-effort address of this host, resolved by
    /// the caller before the cycle; its lookup can degrade but never abort.
    pub async fn collect<S: RegisterSource>(
        &self,
        source: &mut S,
        host_address: &str,
    ) -> Result<Reading> {
        let mut values = Vec::with_capacity(self.register_map.len());

        for &(address, field) in &self.register_map {
            let words = source
                .read_holding_registers(address, WORDS_PER_VALUE)
                .await?;
            if words.len() != WORDS_PER_VALUE as usize {
                return Err(MeterError::decode(
                    field,
                    DecodeFault::ShortResponse {
                        expected: WORDS_PER_VALUE as usize,
                        got: words.len(),
                    },
                ));
            }

            let value = decode_float32(words[0], words[1])
                .map_err(|fault| MeterError::decode(field, fault))?;
            trace!(field, address, value, "register decoded");
            values.push(value);
        }

        let currents = self.phase_currents(&values);
        let phase_imbalance = compute_phase_imbalance(currents)
            .map_err(|fault| MeterError::decode("phase_imbalance", fault))?;

        Ok(Reading {
            timestamp: Local::now().format(TIMESTAMP_FORMAT).to_string(),
            values,
            phase_imbalance,
            meter_id: self.meter_id,
            ip_address: host_address.to_string(),
        })
    }

    fn phase_currents(&self, values: &[f64]) -> [f64; 3] {
        let mut currents = [0.0; 3];
        for (slot, field) in currents.iter_mut().zip(PHASE_CURRENT_FIELDS) {
            // Positions are fixed by the schema; the lookup cannot fail.
            if let Some(index) = REGISTER_FIELDS.iter().position(|f| *f == field) {
                *slot = values[index];
            }
        }
        currents
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Scripted register source: pops one pre-baked response per read.
    struct ScriptedSource {
        responses: VecDeque<Result<Vec<u16>>>,
        reads: usize,
    }

    impl ScriptedSource {
        fn new(responses: Vec<Result<Vec<u16>>>) -> Self {
            Self {
                responses: responses.into(),
                reads: 0,
            }
        }

        /// Every register answers with the same float.
        fn uniform(value: f32, registers: usize) -> Self {
            let bits = value.to_bits();
            let words = vec![bits as u16, (bits >> 16) as u16];
            Self::new((0..registers).map(|_| Ok(words.clone())).collect())
        }
    }

    #[async_trait]
    impl RegisterSource for ScriptedSource {
        async fn read_holding_registers(&mut self, _address: u16, _count: u16) -> Result<Vec<u16>> {
            self.reads += 1;
            self.responses
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Timeout(Duration::from_secs(1)).into()))
        }
    }

    fn test_config() -> Config {
        use figment::providers::{Format, Toml};
        figment::Figment::new()
            .merge(Toml::string(
                r#"
                    [uplink]
                    base_url = "http://collector.example.com/"
                "#,
            ))
            .extract()
            .unwrap()
    }

    #[tokio::test]
    async fn collects_a_complete_reading() {
        let config = test_config();
        let collector = ReadingCollector::new(&config);
        let mut source = ScriptedSource::uniform(12.5, 32);

        let reading = collector.collect(&mut source, "192.168.1.20").await.unwrap();

        assert_eq!(reading.values.len(), 32);
        assert!(reading.values.iter().all(|v| *v == 12.5));
        // Identical phase currents are perfectly balanced.
        assert_eq!(reading.phase_imbalance, 1.0);
        assert_eq!(reading.meter_id, 101);
        assert_eq!(reading.ip_address, "192.168.1.20");
        assert_eq!(reading.timestamp.len(), "2024-03-01 12:00:00".len());
        assert_eq!(source.reads, 32);
    }

    #[tokio::test]
    async fn first_transport_failure_aborts_the_cycle() {
        let config = test_config();
        let collector = ReadingCollector::new(&config);

        // Registers 0-9 succeed, register index 10 fails.
        let bits = 1.0f32.to_bits();
        let ok = vec![bits as u16, (bits >> 16) as u16];
        let mut responses: Vec<Result<Vec<u16>>> = (0..10).map(|_| Ok(ok.clone())).collect();
        responses.push(Err(TransportError::Timeout(Duration::from_secs(1)).into()));
        let mut source = ScriptedSource::new(responses);

        let result = collector.collect(&mut source, "127.0.0.1").await;
        assert!(result.is_err());
        // Aborted at the failing register, not after the full sweep.
        assert_eq!(source.reads, 11);
    }

    #[tokio::test]
    async fn short_response_is_a_decode_error() {
        let config = test_config();
        let collector = ReadingCollector::new(&config);
        let mut source = ScriptedSource::new(vec![Ok(vec![0x0FDB])]);

        let err = collector.collect(&mut source, "127.0.0.1").await.unwrap_err();
        assert!(matches!(err, MeterError::Decode { .. }));
    }

    #[tokio::test]
    async fn zero_currents_abort_the_cycle() {
        let config = test_config();
        let collector = ReadingCollector::new(&config);
        let mut source = ScriptedSource::uniform(0.0, 32);

        let err = collector.collect(&mut source, "127.0.0.1").await.unwrap_err();
        assert!(matches!(
            err,
            MeterError::Decode {
                fault: DecodeFault::ZeroMeanCurrent,
                ..
            }
        ));
    }
}
