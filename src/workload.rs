//! Workload template registry.
//!
//! Each [`WorkloadKind`] describes a fixed per-iteration instruction pattern.
//! A [`WorkloadInstance`] binds a kind to a repetition count and renders an
//! AArch64 assembly source whose loop body is identical for every count; only
//! the bound loaded by [`crate::encoder`] changes.
//!
//! Generated source layout:
//!
//! ```text
//!   <entry>:
//!       mov x10, #0            iteration counter
//!       movz/movk x11          repetition count (encoder)
//!       <setup>                buffers, initial values
//!   loop:
//!       <body>                 instructions_per_iteration instructions
//!       add x10, x10, #1
//!       cmp x10, x11
//!       b.lt loop
//!       <teardown>
//!       <exit sequence>
//! ```

use std::fmt::Write as _;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::encoder::{encode_iteration_count, MAX_REPETITIONS};
use crate::error::{CalibrationError, Result};

/// One line of generated assembly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AsmLine {
    Insn(String),
    Label(String),
}

impl AsmLine {
    fn insn(s: impl Into<String>) -> Self {
        AsmLine::Insn(s.into())
    }

    fn label(s: impl Into<String>) -> Self {
        AsmLine::Label(s.into())
    }

    pub fn is_instruction(&self) -> bool {
        matches!(self, AsmLine::Insn(_))
    }

    fn render(&self, out: &mut String) {
        // Writing into a String cannot fail.
        let _ = match self {
            AsmLine::Insn(s) => writeln!(out, "    {s}"),
            AsmLine::Label(s) => writeln!(out, "{s}:"),
        };
    }
}

/// Operating-system ABI of the generated executable.
///
/// Only the entry symbol and the exit sequence differ between ABIs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetAbi {
    /// macOS / Apple silicon (`_main`, `svc #0x80`).
    Darwin,
    /// Linux AArch64 (`_start`, `svc #0`).
    Linux,
}

impl Default for TargetAbi {
    fn default() -> Self {
        Self::host()
    }
}

impl TargetAbi {
    pub fn host() -> Self {
        if cfg!(target_os = "macos") {
            TargetAbi::Darwin
        } else {
            TargetAbi::Linux
        }
    }

    pub fn entry_symbol(&self) -> &'static str {
        match self {
            TargetAbi::Darwin => "_main",
            TargetAbi::Linux => "_start",
        }
    }

    fn exit_sequence(&self, code: u8) -> Vec<AsmLine> {
        match self {
            TargetAbi::Darwin => vec![
                AsmLine::insn(format!("mov x0, #{code}")),
                AsmLine::insn("mov x16, #1"),
                AsmLine::insn("svc #0x80"),
            ],
            TargetAbi::Linux => vec![
                AsmLine::insn(format!("mov x0, #{code}")),
                AsmLine::insn("mov x8, #93"),
                AsmLine::insn("svc #0"),
            ],
        }
    }
}

/// Calibration workload templates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadKind {
    /// Independent ADDs across five registers (ALU throughput).
    Arithmetic,
    /// Serially dependent ADDs on one register (RAW latency).
    Dependency,
    /// Unconditional taken branches.
    Branch,
    /// Store/load pairs at a 32-byte stride.
    #[value(name = "memorystrided")]
    MemoryStrided,
    /// Independent loads from a pre-filled buffer.
    #[value(name = "loadheavy")]
    LoadHeavy,
    /// Independent stores to sequential addresses.
    #[value(name = "storeheavy")]
    StoreHeavy,
    /// Compare + conditional branch pairs alternating taken / not taken.
    #[value(name = "branchheavy")]
    BranchHeavy,
}

/// Registers receiving the independent loads of [`WorkloadKind::LoadHeavy`].
/// Skips the base (x1), the loop registers (x10, x11) and the platform register (x18).
const LOAD_TARGETS: [&str; 20] = [
    "x0", "x2", "x3", "x4", "x5", "x6", "x7", "x9", "x12", "x13", "x14", "x15", "x16", "x17",
    "x19", "x20", "x21", "x22", "x23", "x24",
];

impl WorkloadKind {
    pub const ALL: [WorkloadKind; 7] = [
        WorkloadKind::Arithmetic,
        WorkloadKind::Dependency,
        WorkloadKind::Branch,
        WorkloadKind::MemoryStrided,
        WorkloadKind::LoadHeavy,
        WorkloadKind::StoreHeavy,
        WorkloadKind::BranchHeavy,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            WorkloadKind::Arithmetic => "arithmetic",
            WorkloadKind::Dependency => "dependency",
            WorkloadKind::Branch => "branch",
            WorkloadKind::MemoryStrided => "memorystrided",
            WorkloadKind::LoadHeavy => "loadheavy",
            WorkloadKind::StoreHeavy => "storeheavy",
            WorkloadKind::BranchHeavy => "branchheavy",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            WorkloadKind::Arithmetic => "20 independent ADDs per iteration (ALU throughput)",
            WorkloadKind::Dependency => "20 dependent ADDs per iteration (RAW hazards)",
            WorkloadKind::Branch => "5 taken branches per iteration (branch predictor)",
            WorkloadKind::MemoryStrided => {
                "10 store/load pairs at 32-byte stride per iteration (strided memory pattern)"
            }
            WorkloadKind::LoadHeavy => "20 independent loads per iteration (load throughput)",
            WorkloadKind::StoreHeavy => "20 independent stores per iteration (store throughput)",
            WorkloadKind::BranchHeavy => {
                "10 compare/conditional-branch pairs per iteration (alternating taken/not-taken)"
            }
        }
    }

    /// Instructions in one loop iteration, excluding the loop control
    /// (`add`/`cmp`/`b.lt`) shared by every template.
    pub fn instructions_per_iteration(&self) -> u64 {
        match self {
            WorkloadKind::Branch => 5,
            WorkloadKind::Arithmetic
            | WorkloadKind::Dependency
            | WorkloadKind::MemoryStrided
            | WorkloadKind::LoadHeavy
            | WorkloadKind::StoreHeavy
            | WorkloadKind::BranchHeavy => 20,
        }
    }

    /// Resolve a template by its registry name.
    pub fn from_name(name: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.name().eq_ignore_ascii_case(name))
            .ok_or_else(|| CalibrationError::UnknownTemplate {
                name: name.to_string(),
            })
    }

    fn buffer_bytes(&self) -> Option<u32> {
        match self {
            WorkloadKind::MemoryStrided => Some(320),
            WorkloadKind::LoadHeavy | WorkloadKind::StoreHeavy => Some(160),
            _ => None,
        }
    }

    /// Straight-line code run once before the loop.
    pub fn setup(&self) -> Vec<AsmLine> {
        let mut lines = Vec::new();
        if let Some(bytes) = self.buffer_bytes() {
            lines.push(AsmLine::insn(format!("sub sp, sp, #{bytes}")));
        }
        match self {
            WorkloadKind::Arithmetic => {
                for r in 0..5 {
                    lines.push(AsmLine::insn(format!("mov x{r}, #0")));
                }
            }
            WorkloadKind::Dependency => lines.push(AsmLine::insn("mov x0, #0")),
            WorkloadKind::Branch | WorkloadKind::BranchHeavy => {}
            WorkloadKind::MemoryStrided => {
                lines.push(AsmLine::insn("mov x0, #7"));
                lines.push(AsmLine::insn("mov x1, sp"));
            }
            WorkloadKind::LoadHeavy => {
                lines.push(AsmLine::insn("mov x1, sp"));
                for i in 0..20u32 {
                    lines.push(AsmLine::insn(format!("mov x2, #{}", i + 1)));
                    lines.push(AsmLine::insn(format!("str x2, [x1, #{}]", i * 8)));
                }
            }
            WorkloadKind::StoreHeavy => {
                lines.push(AsmLine::insn("mov x1, sp"));
                lines.push(AsmLine::insn("mov x2, #99"));
            }
        }
        lines
    }

    /// The per-iteration instruction pattern. Contains exactly
    /// [`Self::instructions_per_iteration`] instructions.
    pub fn body(&self) -> Vec<AsmLine> {
        let mut lines = Vec::new();
        match self {
            WorkloadKind::Arithmetic => {
                for _ in 0..4 {
                    for r in 0..5 {
                        lines.push(AsmLine::insn(format!("add x{r}, x{r}, #1")));
                    }
                }
            }
            WorkloadKind::Dependency => {
                for _ in 0..20 {
                    lines.push(AsmLine::insn("add x0, x0, #1"));
                }
            }
            WorkloadKind::Branch => {
                for i in 1..=5 {
                    lines.push(AsmLine::insn(format!("b br{i}")));
                    lines.push(AsmLine::label(format!("br{i}")));
                }
            }
            WorkloadKind::MemoryStrided => {
                for i in 0..10u32 {
                    let off = i * 32;
                    lines.push(AsmLine::insn(format!("str x0, [x1, #{off}]")));
                    lines.push(AsmLine::insn(format!("ldr x0, [x1, #{off}]")));
                }
            }
            WorkloadKind::LoadHeavy => {
                for (i, reg) in LOAD_TARGETS.iter().enumerate() {
                    lines.push(AsmLine::insn(format!("ldr {reg}, [x1, #{}]", i * 8)));
                }
            }
            WorkloadKind::StoreHeavy => {
                for i in 0..20u32 {
                    lines.push(AsmLine::insn(format!("str x2, [x1, #{}]", i * 8)));
                }
            }
            WorkloadKind::BranchHeavy => {
                // Both outcomes land on the next instruction, so the dynamic
                // count is two per pair whatever the predictor decides.
                for i in 1..=10 {
                    if i % 2 == 1 {
                        lines.push(AsmLine::insn("cmp x10, #0"));
                    } else {
                        lines.push(AsmLine::insn("cmp xzr, x10"));
                    }
                    lines.push(AsmLine::insn(format!("b.ge skip{i}")));
                    lines.push(AsmLine::label(format!("skip{i}")));
                }
            }
        }
        lines
    }

    /// Straight-line code run once after the loop.
    pub fn teardown(&self) -> Vec<AsmLine> {
        match self.buffer_bytes() {
            Some(bytes) => vec![AsmLine::insn(format!("add sp, sp, #{bytes}"))],
            None => Vec::new(),
        }
    }
}

/// Immutable set of templates enabled for a run.
///
/// Built once and passed by reference; lookups by name fail with
/// [`CalibrationError::UnknownTemplate`].
#[derive(Clone, Debug)]
pub struct WorkloadRegistry {
    templates: Vec<WorkloadKind>,
}

impl Default for WorkloadRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl WorkloadRegistry {
    /// Registry containing every template.
    pub fn standard() -> Self {
        Self {
            templates: WorkloadKind::ALL.to_vec(),
        }
    }

    /// Registry restricted to the named templates, in the given order.
    /// An empty selection yields the standard registry.
    pub fn select<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        if names.is_empty() {
            return Ok(Self::standard());
        }
        let mut templates = Vec::with_capacity(names.len());
        for name in names {
            let kind = WorkloadKind::from_name(name.as_ref())?;
            if !templates.contains(&kind) {
                templates.push(kind);
            }
        }
        Ok(Self { templates })
    }

    pub fn lookup(&self, name: &str) -> Result<WorkloadKind> {
        let kind = WorkloadKind::from_name(name)?;
        if self.templates.contains(&kind) {
            Ok(kind)
        } else {
            Err(CalibrationError::UnknownTemplate {
                name: name.to_string(),
            })
        }
    }

    pub fn templates(&self) -> &[WorkloadKind] {
        &self.templates
    }

    /// Render the source for `name` at `repetitions`.
    pub fn generate(&self, name: &str, repetitions: u64, abi: TargetAbi) -> Result<String> {
        let kind = self.lookup(name)?;
        WorkloadInstance::new(kind, repetitions, abi)?.source()
    }
}

/// A template bound to a repetition count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkloadInstance {
    pub kind: WorkloadKind,
    pub repetitions: u64,
    pub abi: TargetAbi,
}

impl WorkloadInstance {
    pub fn new(kind: WorkloadKind, repetitions: u64, abi: TargetAbi) -> Result<Self> {
        if repetitions == 0 {
            return Err(CalibrationError::ZeroRepetitions);
        }
        if repetitions > MAX_REPETITIONS {
            return Err(CalibrationError::RepetitionCountTooLarge {
                count: repetitions,
                max: MAX_REPETITIONS,
            });
        }
        Ok(Self {
            kind,
            repetitions,
            abi,
        })
    }

    /// Instructions executed by the loop body over all iterations.
    pub fn total_work(&self) -> Result<u64> {
        let per_iteration = self.kind.instructions_per_iteration();
        per_iteration
            .checked_mul(self.repetitions)
            .ok_or(CalibrationError::WorkOverflow {
                per_iteration,
                count: self.repetitions,
            })
    }

    pub fn source(&self) -> Result<String> {
        let entry = self.abi.entry_symbol();
        let mut lines = vec![AsmLine::insn("mov x10, #0")];
        lines.extend(
            encode_iteration_count(self.repetitions)?
                .into_iter()
                .map(AsmLine::Insn),
        );
        lines.extend(self.kind.setup());
        lines.push(AsmLine::label("loop"));
        lines.extend(self.kind.body());
        lines.push(AsmLine::insn("add x10, x10, #1"));
        lines.push(AsmLine::insn("cmp x10, x11"));
        lines.push(AsmLine::insn("b.lt loop"));
        lines.extend(self.kind.teardown());
        lines.extend(self.abi.exit_sequence(0));

        let mut out = String::new();
        let _ = writeln!(
            out,
            "// {} calibration workload: {} iterations",
            self.kind.name(),
            self.repetitions
        );
        let _ = writeln!(out, ".global {entry}");
        let _ = writeln!(out, ".align 4");
        out.push('\n');
        let _ = writeln!(out, "{entry}:");
        for line in &lines {
            line.render(&mut out);
        }
        Ok(out)
    }

    /// Hex SHA-256 of the generated source.
    pub fn fingerprint(&self) -> Result<String> {
        Ok(sha256_hex(self.source()?.as_bytes()))
    }
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut hex = String::with_capacity(digest.len() * 2);
    for b in digest {
        let _ = write!(hex, "{b:02x}");
    }
    hex
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::BOUND_REGISTER;

    fn count_instructions(lines: &[AsmLine]) -> u64 {
        lines.iter().filter(|l| l.is_instruction()).count() as u64
    }

    /// Source with the header comment and the count-loading lines removed.
    fn strip_count_dependent(source: &str) -> Vec<String> {
        source
            .lines()
            .filter(|l| !l.starts_with("//"))
            .filter(|l| {
                let t = l.trim_start();
                !((t.starts_with("movz") || t.starts_with("movk")) && t.contains(BOUND_REGISTER))
            })
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn body_matches_declared_instruction_count() {
        for kind in WorkloadKind::ALL {
            assert_eq!(
                count_instructions(&kind.body()),
                kind.instructions_per_iteration(),
                "{}",
                kind.name()
            );
        }
    }

    #[test]
    fn body_is_independent_of_repetition_count() {
        for kind in WorkloadKind::ALL {
            for abi in [TargetAbi::Darwin, TargetAbi::Linux] {
                let small = WorkloadInstance::new(kind, 100, abi).unwrap().source().unwrap();
                let large = WorkloadInstance::new(kind, 32_000_000, abi)
                    .unwrap()
                    .source()
                    .unwrap();
                assert_ne!(small, large);
                assert_eq!(
                    strip_count_dependent(&small),
                    strip_count_dependent(&large),
                    "{} ({abi:?})",
                    kind.name()
                );
            }
        }
    }

    #[test]
    fn source_loads_count_before_loop() {
        let src = WorkloadInstance::new(WorkloadKind::Dependency, 70_000, TargetAbi::Linux)
            .unwrap()
            .source()
            .unwrap();
        let loop_at = src.find("\nloop:").unwrap();
        let movk_at = src.find("movk x11").unwrap();
        assert!(movk_at < loop_at);
        assert!(src.contains(".global _start"));
        assert!(src.contains("mov x8, #93"));
    }

    #[test]
    fn darwin_uses_main_entry() {
        let src = WorkloadInstance::new(WorkloadKind::Branch, 10, TargetAbi::Darwin)
            .unwrap()
            .source()
            .unwrap();
        assert!(src.contains("_main:"));
        assert!(src.contains("svc #0x80"));
    }

    #[test]
    fn total_work_multiplies_per_iteration() {
        let inst = WorkloadInstance::new(WorkloadKind::Branch, 1_000, TargetAbi::Linux).unwrap();
        assert_eq!(inst.total_work().unwrap(), 5_000);
    }

    #[test]
    fn instance_rejects_bad_counts() {
        assert!(matches!(
            WorkloadInstance::new(WorkloadKind::Arithmetic, 0, TargetAbi::Linux),
            Err(CalibrationError::ZeroRepetitions)
        ));
        assert!(matches!(
            WorkloadInstance::new(WorkloadKind::Arithmetic, MAX_REPETITIONS + 1, TargetAbi::Linux),
            Err(CalibrationError::RepetitionCountTooLarge { .. })
        ));
    }

    #[test]
    fn registry_lookup_and_selection() {
        let reg = WorkloadRegistry::standard();
        assert_eq!(reg.templates().len(), 7);
        assert_eq!(reg.lookup("LoadHeavy").unwrap(), WorkloadKind::LoadHeavy);
        assert!(matches!(
            reg.lookup("fma"),
            Err(CalibrationError::UnknownTemplate { name }) if name == "fma"
        ));

        let sub = WorkloadRegistry::select(&["branch", "arithmetic", "branch"]).unwrap();
        assert_eq!(
            sub.templates(),
            &[WorkloadKind::Branch, WorkloadKind::Arithmetic]
        );
        assert!(sub.lookup("dependency").is_err());
        assert!(sub.generate("branch", 100, TargetAbi::Linux).is_ok());
    }

    #[test]
    fn fingerprint_is_stable_and_count_sensitive() {
        let a = WorkloadInstance::new(WorkloadKind::Arithmetic, 1_000, TargetAbi::Linux).unwrap();
        let b = WorkloadInstance::new(WorkloadKind::Arithmetic, 2_000, TargetAbi::Linux).unwrap();
        assert_eq!(a.fingerprint().unwrap(), a.fingerprint().unwrap());
        assert_ne!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
        assert_eq!(a.fingerprint().unwrap().len(), 64);
    }
}
