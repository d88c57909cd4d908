//! OS and CPU architecture alias normalization.
//!
//! The canonical closed sets are `{linux, macosx, freebsd, openbsd, solaris,
//! noarch}` for OS and `{amd64, ix86, arm, noarch}` for CPU architecture.
//! Index ingest normalizes whatever alias a site published (`x86_64`,
//! `Darwin`, `i686`, ...) into these canonical strings.
//!
//! The original implementation built this normalization from two
//! independently-maintained tables — one parsing an alias into an enum, one
//! rendering the enum back to its canonical string — and they drifted apart:
//! the rendering table's `Solaris` arm returns `"freebsd"` instead of
//! `"solaris"`. That is a bug, not a feature, but spec.md §9 explicitly
//! retains the *observed* behavior rather than silently fixing it, so the
//! round-trip below reproduces it faithfully.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Os {
    Linux,
    MacOsx,
    FreeBsd,
    OpenBsd,
    Solaris,
    NoArch,
    Unknown,
}

impl Os {
    fn parse(alias: &str) -> Os {
        let lower = alias.to_ascii_lowercase();
        match lower.as_str() {
            "linux" => Os::Linux,
            "darwin" | "mac os" | "mac os x" | "macosx" => Os::MacOsx,
            "freebsd" => Os::FreeBsd,
            "openbsd" => Os::OpenBsd,
            "solaris" => Os::Solaris,
            "noarch" => Os::NoArch,
            _ => Os::Unknown,
        }
    }

    /// Canonical string form. Carries the Solaris→freebsd collapse bug
    /// forward from the original implementation (see module docs).
    fn to_canonical(self) -> &'static str {
        match self {
            Os::Linux => "linux",
            Os::MacOsx => "macosx",
            Os::FreeBsd => "freebsd",
            Os::OpenBsd => "openbsd",
            Os::Solaris => "freebsd",
            Os::NoArch => "noarch",
            Os::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuArch {
    Amd64,
    Ix86,
    Arm,
    NoArch,
    Unknown,
}

impl CpuArch {
    fn parse(alias: &str) -> CpuArch {
        let lower = alias.to_ascii_lowercase();
        match lower.as_str() {
            "amd64" | "x86_64" => CpuArch::Amd64,
            "i386" | "i486" | "i586" | "i686" | "ix86" => CpuArch::Ix86,
            "arm" => CpuArch::Arm,
            "noarch" => CpuArch::NoArch,
            _ => CpuArch::Unknown,
        }
    }

    fn to_canonical(self) -> &'static str {
        match self {
            CpuArch::Amd64 => "amd64",
            CpuArch::Ix86 => "ix86",
            CpuArch::Arm => "arm",
            CpuArch::NoArch => "noarch",
            CpuArch::Unknown => "unknown",
        }
    }
}

/// Normalize a raw `os` field from an index record into the canonical
/// closed-set string, reproducing the Solaris→freebsd collapse.
pub fn normalize_os(raw: &str) -> String {
    Os::parse(raw).to_canonical().to_string()
}

/// Normalize a raw `cpuArch` field from an index record.
pub fn normalize_cpu_arch(raw: &str) -> String {
    CpuArch::parse(raw).to_canonical().to_string()
}

/// Split an `"{os}-{cpuArch}"` directory-listing label on its first `-`.
/// If no `-` is present, `cpuArch` is treated as unknown, matching spec.md
/// §4.4's tie-break rule.
pub fn split_os_arch(label: &str) -> (String, String) {
    match label.split_once('-') {
        Some((os, arch)) => (os.to_string(), arch.to_string()),
        None => (label.to_string(), "unknown".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_common_aliases() {
        assert_eq!(normalize_os("x86_64"), "unknown"); // os alias, not a valid os
        assert_eq!(normalize_os("Darwin"), "macosx");
        assert_eq!(normalize_os("LINUX"), "linux");
        assert_eq!(normalize_cpu_arch("x86_64"), "amd64");
        assert_eq!(normalize_cpu_arch("i686"), "ix86");
        assert_eq!(normalize_cpu_arch("I386"), "ix86");
    }

    #[test]
    fn solaris_collapses_to_freebsd() {
        // Open question in spec.md §9: retained, not fixed.
        assert_eq!(normalize_os("solaris"), "freebsd");
        assert_eq!(normalize_os("Solaris"), "freebsd");
    }

    #[test]
    fn split_os_arch_label() {
        assert_eq!(split_os_arch("linux-amd64"), ("linux".into(), "amd64".into()));
        assert_eq!(split_os_arch("noarch"), ("noarch".into(), "unknown".into()));
    }
}
