use crate::bail;
use crate::error::Result;
use std::fmt::Display;

/// The architectures we can read input files for. The 32-bit targets are recognised so that their
/// section dialects (`SHT_ARM_EXIDX`, `.got2` etc.) dispatch correctly; relocation application is
/// out of scope for this crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Architecture {
    X86_64,
    AArch64,
    Arm,
    RiscV64,
    Ppc32,
    LoongArch64,
}

impl TryFrom<u16> for Architecture {
    type Error = crate::error::Error;

    fn try_from(e_machine: u16) -> Result<Self> {
        match e_machine {
            object::elf::EM_X86_64 => Ok(Architecture::X86_64),
            object::elf::EM_AARCH64 => Ok(Architecture::AArch64),
            object::elf::EM_ARM => Ok(Architecture::Arm),
            object::elf::EM_RISCV => Ok(Architecture::RiscV64),
            object::elf::EM_PPC => Ok(Architecture::Ppc32),
            object::elf::EM_LOONGARCH => Ok(Architecture::LoongArch64),
            _ => bail!("Unsupported e_machine 0x{e_machine:x}"),
        }
    }
}

impl Architecture {
    /// Whether relocations on this architecture carry explicit addends. CREL tables with addends
    /// are rejected on architectures where this is false.
    pub(crate) fn is_rela(self) -> bool {
        !matches!(self, Architecture::Arm)
    }

    /// Relocation tables are sorted by `r_offset` on most architectures, but RISC-V and LoongArch
    /// don't follow that convention.
    pub(crate) fn needs_sorted_relocations(self) -> bool {
        matches!(self, Architecture::RiscV64 | Architecture::LoongArch64)
    }

    /// The word-sized absolute relocation type.
    pub(crate) fn r_abs(self) -> u32 {
        match self {
            Architecture::X86_64 => object::elf::R_X86_64_64,
            Architecture::AArch64 => object::elf::R_AARCH64_ABS64,
            Architecture::Arm => object::elf::R_ARM_ABS32,
            Architecture::RiscV64 => object::elf::R_RISCV_64,
            Architecture::Ppc32 => object::elf::R_PPC_ADDR32,
            Architecture::LoongArch64 => object::elf::R_LARCH_64,
        }
    }
}

impl Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Architecture::X86_64 => "x86_64",
            Architecture::AArch64 => "aarch64",
            Architecture::Arm => "arm",
            Architecture::RiscV64 => "riscv64",
            Architecture::Ppc32 => "ppc32",
            Architecture::LoongArch64 => "loongarch64",
        };
        f.write_str(name)
    }
}
