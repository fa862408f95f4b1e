use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Architectural op class.
///
/// Decides which execution pipeline an instruction issues to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArchOp {
    NO_OP,
    ALU_OP,
    SP_OP,
    INT_OP,
    DP_OP,
    SFU_OP,
    LOAD_OP,
    STORE_OP,
    BARRIER_OP,
    MEMORY_BARRIER_OP,
    EXIT_OPS,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Opcode {
    pub mnemonic: &'static str,
    pub category: ArchOp,
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.mnemonic)
    }
}

macro_rules! opcodes {
    ($($mnemonic:literal => $category:ident),* $(,)?) => {
        {
            let mut map = HashMap::new();
            $(map.insert($mnemonic, Opcode { mnemonic: $mnemonic, category: ArchOp::$category });)*
            map
        }
    };
}

/// SASS mnemonic to op class.
static OPCODE_MAP: Lazy<HashMap<&'static str, Opcode>> = Lazy::new(|| {
    opcodes! {
        "NOP" => NO_OP,
        "MOV" => ALU_OP,
        "SEL" => ALU_OP,
        "SHF" => ALU_OP,
        "SHL" => ALU_OP,
        "SHR" => ALU_OP,
        "AND" => ALU_OP,
        "OR" => ALU_OP,
        "XOR" => ALU_OP,
        "NOT" => ALU_OP,
        "ADD" => INT_OP,
        "IADD" => INT_OP,
        "IADD3" => INT_OP,
        "IMAD" => INT_OP,
        "IMUL" => INT_OP,
        "ISETP" => INT_OP,
        "LEA" => INT_OP,
        "LOP3" => INT_OP,
        "POPC" => INT_OP,
        "FADD" => SP_OP,
        "FMUL" => SP_OP,
        "FFMA" => SP_OP,
        "FMNMX" => SP_OP,
        "FSET" => SP_OP,
        "FSETP" => SP_OP,
        "DADD" => DP_OP,
        "DMUL" => DP_OP,
        "DFMA" => DP_OP,
        "MUFU" => SFU_OP,
        "SQRT" => SFU_OP,
        "RSQRT" => SFU_OP,
        "SIN" => SFU_OP,
        "COS" => SFU_OP,
        "LG2" => SFU_OP,
        "EX2" => SFU_OP,
        "RCP" => SFU_OP,
        "LD" => LOAD_OP,
        "LDG" => LOAD_OP,
        "LDL" => LOAD_OP,
        "ST" => STORE_OP,
        "STG" => STORE_OP,
        "STL" => STORE_OP,
        "BAR" => BARRIER_OP,
        "MEMBAR" => MEMORY_BARRIER_OP,
        "EXIT" => EXIT_OPS,
        "RET" => EXIT_OPS,
    }
});

/// Look up an opcode by its trace mnemonic.
///
/// Modifier suffixes are ignored: `sqrt.approx.ftz.f32` and `SQRT` map to
/// the same opcode.
#[must_use]
pub fn lookup(mnemonic: &str) -> Option<Opcode> {
    let base = mnemonic.split('.').next().unwrap_or(mnemonic);
    let base = base.to_ascii_uppercase();
    OPCODE_MAP.get(base.as_str()).copied()
}

#[cfg(test)]
mod tests {
    use super::ArchOp;

    #[test]
    fn lookup_ignores_modifiers() {
        assert_eq!(
            super::lookup("sqrt.approx.ftz.f32").map(|op| op.category),
            Some(ArchOp::SFU_OP)
        );
        assert_eq!(
            super::lookup("LDG.E.128").map(|op| op.category),
            Some(ArchOp::LOAD_OP)
        );
        assert_eq!(super::lookup("ADD").map(|op| op.category), Some(ArchOp::INT_OP));
        assert_eq!(super::lookup("bogus"), None);
    }
}
