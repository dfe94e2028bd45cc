//! Machine-code bodies for the two register-access primitives.
//!
//! Each entry is keyed by pointer width and calling convention. The identify
//! stub has the C signature `void identify(u32 leaf, u32 subleaf, u32 out[4])`
//! and stores EAX, EBX, ECX, EDX in that order. The cycle-count stub has the
//! signature `u64 cycle_count(void)`.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointerWidth {
    Bits32,
    Bits64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Abi {
    /// x86_64 System V (Linux, BSD, macOS)
    SystemV,
    /// Microsoft x64
    Microsoft64,
    /// 32-bit cdecl, arguments on the stack
    Cdecl,
}

#[derive(Debug)]
pub struct StubSet {
    pub identify: &'static [u8],
    pub cycle_count: &'static [u8],
}

// leaf in edi, subleaf in esi, out in rdx
const IDENTIFY_SYSV64: &[u8] = &[
    0x53, //                   push rbx
    0x49, 0x89, 0xD0, //       mov r8, rdx
    0x89, 0xF8, //             mov eax, edi
    0x89, 0xF1, //             mov ecx, esi
    0x0F, 0xA2, //             cpuid
    0x41, 0x89, 0x00, //       mov [r8], eax
    0x41, 0x89, 0x58, 0x04, // mov [r8+4], ebx
    0x41, 0x89, 0x48, 0x08, // mov [r8+8], ecx
    0x41, 0x89, 0x50, 0x0C, // mov [r8+12], edx
    0x5B, //                   pop rbx
    0xC3, //                   ret
];

// leaf in ecx, subleaf in edx, out in r8
const IDENTIFY_WIN64: &[u8] = &[
    0x53, //                   push rbx
    0x89, 0xC8, //             mov eax, ecx
    0x89, 0xD1, //             mov ecx, edx
    0x0F, 0xA2, //             cpuid
    0x41, 0x89, 0x00, //       mov [r8], eax
    0x41, 0x89, 0x58, 0x04, // mov [r8+4], ebx
    0x41, 0x89, 0x48, 0x08, // mov [r8+8], ecx
    0x41, 0x89, 0x50, 0x0C, // mov [r8+12], edx
    0x5B, //                   pop rbx
    0xC3, //                   ret
];

// arguments at [esp+4], [esp+8], [esp+12] on entry
const IDENTIFY_CDECL32: &[u8] = &[
    0x53, //                   push ebx
    0x57, //                   push edi
    0x8B, 0x44, 0x24, 0x0C, // mov eax, [esp+12]
    0x8B, 0x4C, 0x24, 0x10, // mov ecx, [esp+16]
    0x8B, 0x7C, 0x24, 0x14, // mov edi, [esp+20]
    0x0F, 0xA2, //             cpuid
    0x89, 0x07, //             mov [edi], eax
    0x89, 0x5F, 0x04, //       mov [edi+4], ebx
    0x89, 0x4F, 0x08, //       mov [edi+8], ecx
    0x89, 0x57, 0x0C, //       mov [edi+12], edx
    0x5F, //                   pop edi
    0x5B, //                   pop ebx
    0xC3, //                   ret
];

// result in rax for both 64-bit conventions
const CYCLE_COUNT_64: &[u8] = &[
    0x0F, 0x31, //             rdtsc
    0x48, 0xC1, 0xE2, 0x20, // shl rdx, 32
    0x48, 0x09, 0xD0, //       or rax, rdx
    0xC3, //                   ret
];

// edx:eax is already the cdecl u64 return pair
const CYCLE_COUNT_32: &[u8] = &[
    0x0F, 0x31, // rdtsc
    0xC3, //       ret
];

static STUBS: &[((PointerWidth, Abi), StubSet)] = &[
    (
        (PointerWidth::Bits64, Abi::SystemV),
        StubSet {
            identify: IDENTIFY_SYSV64,
            cycle_count: CYCLE_COUNT_64,
        },
    ),
    (
        (PointerWidth::Bits64, Abi::Microsoft64),
        StubSet {
            identify: IDENTIFY_WIN64,
            cycle_count: CYCLE_COUNT_64,
        },
    ),
    (
        (PointerWidth::Bits32, Abi::Cdecl),
        StubSet {
            identify: IDENTIFY_CDECL32,
            cycle_count: CYCLE_COUNT_32,
        },
    ),
];

/// Looks up the stubs for a pointer width and calling convention.
pub fn stub_for(width: PointerWidth, abi: Abi) -> Option<&'static StubSet> {
    STUBS
        .iter()
        .find(|(key, _)| *key == (width, abi))
        .map(|(_, stubs)| stubs)
}

/// Pointer width and calling convention of the running build, if it is x86.
pub fn host_target() -> Option<(PointerWidth, Abi)> {
    if cfg!(target_arch = "x86_64") {
        let abi = if cfg!(target_os = "windows") {
            Abi::Microsoft64
        } else {
            Abi::SystemV
        };
        Some((PointerWidth::Bits64, abi))
    } else if cfg!(target_arch = "x86") {
        Some((PointerWidth::Bits32, Abi::Cdecl))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CPUID: [u8; 2] = [0x0F, 0xA2];
    const RDTSC: [u8; 2] = [0x0F, 0x31];

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    #[test]
    fn every_supported_target_has_both_stubs() {
        for (width, abi) in [
            (PointerWidth::Bits64, Abi::SystemV),
            (PointerWidth::Bits64, Abi::Microsoft64),
            (PointerWidth::Bits32, Abi::Cdecl),
        ] {
            let stubs = stub_for(width, abi).unwrap();
            assert!(contains(stubs.identify, &CPUID), "{width:?}/{abi:?}");
            assert!(contains(stubs.cycle_count, &RDTSC), "{width:?}/{abi:?}");
            assert_eq!(stubs.identify.last(), Some(&0xC3));
            assert_eq!(stubs.cycle_count.last(), Some(&0xC3));
        }
    }

    #[test]
    fn mismatched_width_and_abi_has_no_stub() {
        assert!(stub_for(PointerWidth::Bits32, Abi::SystemV).is_none());
        assert!(stub_for(PointerWidth::Bits64, Abi::Cdecl).is_none());
    }

    #[test]
    fn identify_stubs_preserve_ebx() {
        // cpuid clobbers ebx, which every supported convention treats as callee-saved
        for ((_, _), stubs) in STUBS {
            assert_eq!(stubs.identify[0], 0x53);
            let body = &stubs.identify[..stubs.identify.len() - 1];
            assert!(body.contains(&0x5B));
        }
    }

    #[test]
    fn host_target_matches_build() {
        let target = host_target();
        if cfg!(any(target_arch = "x86", target_arch = "x86_64")) {
            let (width, abi) = target.unwrap();
            assert!(stub_for(width, abi).is_some());
        } else {
            assert!(target.is_none());
        }
    }
}
