use std::fmt;
use std::str::FromStr;

/// Target architectures a build can be configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
  Armv5l,
  Armv7b,
  Armv7l,
  Armv7lhf,
  Armv8l64,
  Armv8b64,
  Mips32b,
  Mips32l,
  Mips64b,
  Mips64l,
  Ppc64,
  X86_32,
  X86_64,
}

impl Arch {
  pub const ALL: [Arch; 13] = [
    Self::Armv5l,
    Self::Armv7b,
    Self::Armv7l,
    Self::Armv7lhf,
    Self::Armv8l64,
    Self::Armv8b64,
    Self::Mips32b,
    Self::Mips32l,
    Self::Mips64b,
    Self::Mips64l,
    Self::Ppc64,
    Self::X86_32,
    Self::X86_64,
  ];

  /// Returns the identifier used in definitions and on the command line
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Armv5l => "armv5l",
      Self::Armv7b => "armv7b",
      Self::Armv7l => "armv7l",
      Self::Armv7lhf => "armv7lhf",
      Self::Armv8l64 => "armv8l64",
      Self::Armv8b64 => "armv8b64",
      Self::Mips32b => "mips32b",
      Self::Mips32l => "mips32l",
      Self::Mips64b => "mips64b",
      Self::Mips64l => "mips64l",
      Self::Ppc64 => "ppc64",
      Self::X86_32 => "x86_32",
      Self::X86_64 => "x86_64",
    }
  }

  /// Returns the GNU cpu name used to build target triplets
  pub fn cpu(&self) -> &'static str {
    match self {
      Self::Armv8l64 => "aarch64",
      Self::Armv8b64 => "aarch64_be",
      Self::Mips32b => "mips",
      Self::Mips32l => "mipsel",
      Self::Mips64b => "mips64",
      Self::Mips64l => "mips64el",
      Self::Ppc64 => "powerpc64",
      Self::X86_32 => "i686",
      other => other.as_str(),
    }
  }

  /// Returns the ABI suffix appended to target triplets
  pub fn abi(&self) -> &'static str {
    match self {
      Self::Armv5l | Self::Armv7b | Self::Armv7l | Self::Armv7lhf => "eabi",
      Self::Mips64b | Self::Mips64l => "abi64",
      _ => "",
    }
  }

  /// `<cpu>-baserock-linux-gnu<abi>`
  pub fn target(&self) -> String {
    format!("{}-baserock-linux-gnu{}", self.cpu(), self.abi())
  }

  /// `<cpu>-bootstrap-linux-gnu<abi>`
  pub fn target_stage1(&self) -> String {
    format!("{}-bootstrap-linux-gnu{}", self.cpu(), self.abi())
  }
}

impl fmt::Display for Arch {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.as_str())
  }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown architecture '{0}'")]
pub struct UnknownArch(pub String);

impl FromStr for Arch {
  type Err = UnknownArch;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::ALL
      .iter()
      .copied()
      .find(|arch| arch.as_str() == s)
      .ok_or_else(|| UnknownArch(s.to_string()))
  }
}
