//! System configuration: the recognized option set from §6, parsed and validated once at
//! startup (and optionally reloaded) before any component is constructed.

use {
    crate::error::{
        ConfigError, InvalidAssociativitySnafu, MemoryTooSmallSnafu, NoCpusSnafu,
        NotPowerOfTwoSnafu, OverlappingWindowsSnafu, ParseSnafu,
    },
    serde::Deserialize,
    snafu::{ensure, ResultExt},
};

/// Cache replacement policy, selectable per level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ReplacementPolicy {
    Lru,
    Clock,
    Random,
}

/// Cache write policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum WritePolicy {
    WriteBack,
    WriteThrough,
}

/// Coherence protocol. Only MESI is implemented; the field exists so a future protocol can be
/// selected without changing the `Config` shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CoherenceProtocol {
    Mesi,
}

/// MMIO device window kind; see §4.2 and §6 for the bus-address encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum WindowKind {
    Dense,
    Sparse,
    Csr,
}

/// One registered MMIO window, as read from `mmio.windows`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MmioWindowConfig {
    pub kind: WindowKind,
    pub base: u64,
    pub size: u64,
    pub tag: String,
}

/// Geometry of one cache level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct CacheConfig {
    pub sets: usize,
    pub assoc: usize,
    pub line: usize,
}

impl CacheConfig {
    fn validate(&self, prefix: &'static str) -> Result<(), ConfigError> {
        ensure!(
            self.sets.is_power_of_two(),
            NotPowerOfTwoSnafu { field: prefix, value: self.sets }
        );
        ensure!(
            self.line.is_power_of_two(),
            NotPowerOfTwoSnafu { field: prefix, value: self.line }
        );
        ensure!(
            (2..=32).contains(&self.assoc),
            InvalidAssociativitySnafu { field: prefix, value: self.assoc }
        );
        Ok(())
    }
}

/// TLB capacities and ASN width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TlbConfig {
    pub i_entries: usize,
    pub d_entries: usize,
    pub asn_bits: u32,
}

/// Replacement/write/coherence policy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PolicyConfig {
    pub replacement: ReplacementPolicy,
    pub write: WritePolicy,
    pub coherence: CoherenceProtocol,
}

/// SMP barrier coordination parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct BarrierConfig {
    pub timeout_ms: u64,
}

/// CPU topology.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CpuConfig {
    pub count: usize,
    pub model: String,
}

/// Backing RAM size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct MemoryConfig {
    pub size_gb: u64,
}

/// The full recognized option set (§6).
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub cpu: CpuConfig,
    pub memory: MemoryConfig,
    pub l1d: CacheConfig,
    pub l1i: CacheConfig,
    pub l2: CacheConfig,
    pub l3: CacheConfig,
    pub tlb: TlbConfig,
    pub policy: PolicyConfig,
    pub barriers: BarrierConfig,
    #[serde(default)]
    pub mmio: MmioConfig,
}

/// `mmio.windows = [...]`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MmioConfig {
    #[serde(default)]
    pub windows: Vec<MmioWindowConfig>,
}

impl Config {
    /// Parse from a TOML document, then validate.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text).context(ParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// A small configuration suitable for unit and integration tests: one CPU, 16 MiB of RAM,
    /// minimal cache geometry, no MMIO windows.
    pub fn minimal_for_tests() -> Self {
        Config {
            cpu: CpuConfig { count: 1, model: "21264".into() },
            memory: MemoryConfig { size_gb: 4 },
            l1d: CacheConfig { sets: 64, assoc: 2, line: 64 },
            l1i: CacheConfig { sets: 64, assoc: 2, line: 64 },
            l2: CacheConfig { sets: 256, assoc: 8, line: 64 },
            l3: CacheConfig { sets: 1024, assoc: 16, line: 64 },
            tlb: TlbConfig { i_entries: 48, d_entries: 64, asn_bits: 8 },
            policy: PolicyConfig {
                replacement: ReplacementPolicy::Lru,
                write: WritePolicy::WriteBack,
                coherence: CoherenceProtocol::Mesi,
            },
            barriers: BarrierConfig { timeout_ms: 100 },
            mmio: MmioConfig::default(),
        }
    }

    /// Reject malformed configuration before any component is built (§4.11).
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(self.cpu.count > 0, NoCpusSnafu);
        ensure!(
            self.memory.size_gb >= 4,
            MemoryTooSmallSnafu { size_gb: self.memory.size_gb }
        );
        self.l1d.validate("l1d")?;
        self.l1i.validate("l1i")?;
        self.l2.validate("l2")?;
        self.l3.validate("l3")?;

        let mut windows = self.mmio.windows.iter().collect::<Vec<_>>();
        windows.sort_by_key(|w| w.base);
        for pair in windows.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            let a_end = a.base + a.size;
            if a_end > b.base {
                return OverlappingWindowsSnafu {
                    a_base: a.base,
                    a_end,
                    b_base: b.base,
                    b_end: b.base + b.size,
                }
                .fail();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_validates() {
        Config::minimal_for_tests().validate().unwrap();
    }

    #[test]
    fn rejects_memory_below_minimum() {
        let mut config = Config::minimal_for_tests();
        config.memory.size_gb = 1;
        assert!(matches!(config.validate(), Err(ConfigError::MemoryTooSmall { .. })));
    }

    #[test]
    fn rejects_non_power_of_two_geometry() {
        let mut config = Config::minimal_for_tests();
        config.l1d.sets = 3;
        assert!(matches!(config.validate(), Err(ConfigError::NotPowerOfTwo { .. })));
    }

    #[test]
    fn rejects_overlapping_windows() {
        let mut config = Config::minimal_for_tests();
        config.mmio.windows.push(MmioWindowConfig {
            kind: WindowKind::Dense,
            base: 0x1000,
            size: 0x100,
            tag: "a".into(),
        });
        config.mmio.windows.push(MmioWindowConfig {
            kind: WindowKind::Dense,
            base: 0x1080,
            size: 0x100,
            tag: "b".into(),
        });
        assert!(matches!(config.validate(), Err(ConfigError::OverlappingWindows { .. })));
    }

    #[test]
    fn parses_toml_document() {
        let text = r#"
            [cpu]
            count = 2
            model = "21264"

            [memory]
            size_gb = 4

            [l1d]
            sets = 64
            assoc = 2
            line = 64

            [l1i]
            sets = 64
            assoc = 2
            line = 64

            [l2]
            sets = 256
            assoc = 8
            line = 64

            [l3]
            sets = 1024
            assoc = 16
            line = 64

            [tlb]
            i_entries = 48
            d_entries = 64
            asn_bits = 8

            [policy]
            replacement = "Lru"
            write = "WriteBack"
            coherence = "MESI"

            [barriers]
            timeout_ms = 100
        "#;
        let config = Config::from_toml(text).unwrap();
        assert_eq!(config.cpu.count, 2);
    }
}
