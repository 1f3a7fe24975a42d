/// Bytecode instructions for the CyberBasic VM.
///
/// Every instruction is a one-byte opcode followed by fixed-width operands:
/// - `Const`: one-byte constant pool index
/// - `Slot`: one-byte variable slot
/// - `Count`: one-byte count
/// - `Rel16`: i16 little-endian jump, relative to the byte after the operand
/// - `Abs16`: u16 little-endian absolute code offset
///
/// `CreateArray` is the only variable-width instruction: `n`, then `n`
/// constant indices holding the dimension sizes, then the target slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Const,
    Slot,
    Count,
    Rel16,
    Abs16,
}

impl Operand {
    pub fn width(self) -> usize {
        match self {
            Operand::Const | Operand::Slot | Operand::Count => 1,
            Operand::Rel16 | Operand::Abs16 => 2,
        }
    }
}

macro_rules! opcodes {
    ($($name:ident = $byte:literal [$($operand:ident),*],)*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Op {
            $($name = $byte,)*
        }

        impl Op {
            /// Fixed operand layout following the opcode byte.
            pub fn operands(self) -> &'static [Operand] {
                match self {
                    $(Op::$name => &[$(Operand::$operand),*],)*
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(Op::$name => stringify!($name),)*
                }
            }
        }

        impl TryFrom<u8> for Op {
            type Error = u8;

            fn try_from(byte: u8) -> Result<Self, u8> {
                match byte {
                    $($byte => Ok(Op::$name),)*
                    other => Err(other),
                }
            }
        }
    };
}

opcodes! {
    // ========================================
    // Stack and storage
    // ========================================
    LoadConst = 0 [Const],
    LoadString = 1 [Const],
    LoadVar = 2 [Slot],
    StoreVar = 3 [Slot],
    LoadLocal = 4 [Slot],
    StoreLocal = 5 [Slot],
    LoadGlobal = 6 [Const],
    StoreGlobal = 7 [Const],
    Pop = 8 [],
    Dup = 9 [],

    // ========================================
    // Arithmetic and logic
    // ========================================
    Add = 16 [],
    Sub = 17 [],
    Mul = 18 [],
    Div = 19 [],
    Mod = 20 [],
    Power = 21 [],
    IntDiv = 22 [],
    Neg = 23 [],
    Equal = 24 [],
    NotEqual = 25 [],
    Less = 26 [],
    LessEqual = 27 [],
    Greater = 28 [],
    GreaterEqual = 29 [],
    And = 30 [],
    Or = 31 [],
    Xor = 32 [],
    Not = 33 [],

    // ========================================
    // Control
    // ========================================
    Jump = 40 [Rel16],
    JumpIfFalse = 41 [Rel16],
    JumpIfTrue = 42 [Rel16],
    CallUser = 43 [Const, Count],
    CallForeign = 44 [Const, Count],
    Return = 45 [],
    ReturnVal = 46 [],
    Halt = 47 [],
    Quit = 48 [],

    // ========================================
    // Scheduling and events
    // ========================================
    StartCoroutine = 56 [Abs16, Const],
    Yield = 57 [],
    WaitSeconds = 58 [],
    RegisterEvent = 59 [Const, Const, Abs16],

    // ========================================
    // Arrays, entities and output
    // ========================================
    CreateArray = 64 [],
    LoadArray = 65 [Slot],
    StoreArray = 66 [Slot],
    MatMul = 67 [Const, Const, Const],
    LoadEntityProp = 68 [Const, Const],
    StoreEntityProp = 69 [Const, Const],
    Print = 70 [],

    // ========================================
    // Builtins: strings and conversion
    // ========================================
    Str = 80 [],
    Int = 81 [],
    Len = 82 [],
    Left = 83 [],
    Right = 84 [],
    Mid = 85 [],

    // ========================================
    // Builtins: timing and randomness
    // ========================================
    Random = 88 [],
    RandomN = 89 [],
    Timer = 90 [],
    ResetTimer = 91 [],
    Sleep = 92 [],

    // ========================================
    // Builtins: math
    // ========================================
    Sin = 96 [],
    Cos = 97 [],
    Tan = 98 [],
    Sqrt = 99 [],
    Abs = 100 [],
    Floor = 101 [],
    Ceil = 102 [],
    Round = 103 [],
    Min = 104 [],
    Max = 105 [],
    Clamp = 106 [],
    Lerp = 107 [],
    Exp = 108 [],
    Log = 109 [],
    Log10 = 110 [],
    Atan2 = 111 [],
    Sign = 112 [],
    Deg2Rad = 113 [],
    Rad2Deg = 114 [],
    Noise2D = 115 [],

    // ========================================
    // Builtins: geometry
    // ========================================
    Distance2D = 120 [],
    Distance3D = 121 [],
    DistSq2D = 122 [],
    DistSq3D = 123 [],
    InRadius2D = 124 [],
    InRadius3D = 125 [],
    Angle2D = 126 [],

    // ========================================
    // Builtins: files
    // ========================================
    OpenFile = 128 [],
    ReadLine = 129 [],
    WriteLine = 130 [],
    CloseFile = 131 [],
    Eof = 132 [],
}

impl Op {
    /// Encoded size of an instruction starting at `code[offset]`, including
    /// the opcode byte. Returns None when the instruction is truncated.
    pub fn encoded_len(self, code: &[u8], offset: usize) -> Option<usize> {
        let len = if self == Op::CreateArray {
            let dims = *code.get(offset + 1)? as usize;
            1 + 1 + dims + 1
        } else {
            1 + self.operands().iter().map(|o| o.width()).sum::<usize>()
        };
        if offset + len > code.len() {
            return None;
        }
        Some(len)
    }
}
