#[cfg(test)]
mod tests {
    use crate::virtual_machine::isa::Instruction;
    use std::collections::HashSet;

    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;
    const EXPECTED_ISA_HASH: u64 = 5984034195647195280;

    fn fnv1a64(mut h: u64, bytes: &[u8]) -> u64 {
        for b in bytes {
            h ^= *b as u64;
            h = h.wrapping_mul(FNV_PRIME);
        }
        h
    }

    macro_rules! hash_isa {
        (
            $( $(#[$doc:meta])* $name:ident = $opcode:expr, $mnemonic:literal => [ $( $field:ident : $kind:ident ),* $(,)? ] ),* $(,)?
        ) => {{
            let mut h = FNV_OFFSET;
            $(
                h = fnv1a64(h, stringify!($name).as_bytes());
                h = fnv1a64(h, &[Instruction::$name as u8]);
                h = fnv1a64(h, $mnemonic.as_bytes());
                $( h = fnv1a64(h, stringify!($kind).as_bytes()); )*
            )*
            h
        }};
    }

    fn current_isa_hash() -> u64 {
        crate::for_each_instruction!(hash_isa)
    }

    #[test]
    #[ignore]
    fn print_isa_hash() {
        println!("ISA_HASH={}", current_isa_hash());
    }

    /// Deployed modules depend on the encoding; any table edit must be deliberate.
    #[test]
    fn isa_hash_unchanged() {
        assert_eq!(current_isa_hash(), EXPECTED_ISA_HASH);
    }

    #[test]
    fn opcodes_and_mnemonics_unique() {
        let opcodes: HashSet<u8> = Instruction::ALL.iter().map(|i| *i as u8).collect();
        let mnemonics: HashSet<&str> = Instruction::ALL.iter().map(|i| i.mnemonic()).collect();
        assert_eq!(opcodes.len(), Instruction::ALL.len());
        assert_eq!(mnemonics.len(), Instruction::ALL.len());
        assert!(!opcodes.contains(&0));
    }
}
