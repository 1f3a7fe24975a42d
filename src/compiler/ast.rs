//! Syntax tree shared by the front end and the code generator.
//!
//! The tree derives serde so an external front end can hand a program over as
//! JSON (`cyberbasic run program.json`). Every node is an object whose `node`
//! field names its kind; statements may carry a `line`.

use serde::{Deserialize, Serialize};

/// A complete program: top-level statements in source order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub statements: Vec<Stmt>,
}

/// A statement with its source line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stmt {
    #[serde(flatten)]
    pub kind: StmtKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
}

impl Stmt {
    pub fn new(kind: StmtKind, line: usize) -> Self {
        Self {
            kind,
            line: Some(line),
        }
    }
}

impl From<StmtKind> for Stmt {
    fn from(kind: StmtKind) -> Self {
        Self { kind, line: None }
    }
}

pub type Block = Vec<Stmt>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node")]
pub enum StmtKind {
    /// An expression evaluated for its effect (usually a call).
    #[serde(rename = "ExpressionStatement")]
    Expr { expr: Expr },
    /// `x = e` or `a(i, j) = e`.
    #[serde(rename = "Assignment")]
    Assign {
        target: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        indices: Vec<Expr>,
        value: Expr,
    },
    /// `Entity.prop = e`
    MemberAssign {
        object: String,
        member: String,
        value: Expr,
    },
    /// `x += e` and friends; `op` is the arithmetic operator (`+`, `-`, `*`, `/`).
    CompoundAssign {
        target: String,
        op: String,
        value: Expr,
    },
    If {
        condition: Expr,
        then_block: Block,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        else_ifs: Vec<ElseIf>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        else_block: Option<Block>,
    },
    For {
        variable: String,
        start: Expr,
        end: Expr,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step: Option<Expr>,
        body: Block,
    },
    While {
        condition: Expr,
        body: Block,
    },
    /// `REPEAT .. UNTIL cond`; the body runs at least once.
    Repeat {
        body: Block,
        condition: Expr,
    },
    SelectCase {
        subject: Expr,
        cases: Vec<CaseClause>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        else_block: Option<Block>,
    },
    #[serde(rename = "FunctionDecl")]
    Function(FunctionDecl),
    #[serde(rename = "SubDecl")]
    Sub(FunctionDecl),
    #[serde(rename = "ModuleStatement")]
    Module { name: String, body: Block },
    #[serde(rename = "TypeDecl")]
    Type(TypeDecl),
    #[serde(rename = "EntityDecl")]
    Entity(EntityDecl),
    #[serde(rename = "ConstStatement")]
    Const { decls: Vec<ConstDecl> },
    #[serde(rename = "EnumStatement")]
    Enum {
        name: String,
        members: Vec<EnumMember>,
    },
    Dim { vars: Vec<DimVar> },
    /// `ON KeyDown("ESCAPE") .. END ON`
    #[serde(rename = "OnEventStatement")]
    OnEvent {
        event: String,
        key: String,
        body: Block,
    },
    StartCoroutine { sub_name: String },
    Yield,
    WaitSeconds { seconds: Expr },
    /// `EXIT FOR` / `EXIT WHILE`; leaves the innermost loop.
    ExitLoop { kind: String },
    ContinueLoop { kind: String },
    Return {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Expr>,
    },
    Assert {
        condition: Expr,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElseIf {
    pub condition: Expr,
    pub body: Block,
}

/// One `CASE v1, v2` arm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseClause {
    pub values: Vec<Expr>,
    pub body: Block,
}

/// A Function or Sub body. Subs never return a value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDecl {
    pub name: String,
    /// Enclosing module, filled in by the parser for `MODULE` members
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    pub params: Vec<String>,
    pub body: Block,
}

impl FunctionDecl {
    /// Lowercase, module-qualified name used in the function table.
    pub fn qualified_name(&self) -> String {
        match &self.module {
            Some(module) => format!("{}.{}", module, self.name).to_lowercase(),
            None => self.name.to_lowercase(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDecl {
    pub name: String,
    pub fields: Vec<TypeField>,
}

/// A field of a TYPE; `x AS Float = 1.5` carries a constant value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeField {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub const_value: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDecl {
    pub name: String,
    pub properties: Vec<EntityProperty>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityProperty {
    pub name: String,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstDecl {
    pub name: String,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumMember {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Expr>,
}

/// `DIM name(d1, d2) AS Type`. Empty `dimensions` declares a scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimVar {
    pub name: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub var_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dimensions: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node")]
pub enum Expr {
    /// Numeric literal kept as source text; the code generator decides
    /// between Int and Float.
    #[serde(rename = "NumberLiteral")]
    Number { text: String },
    #[serde(rename = "StringLiteral")]
    Str { value: String },
    #[serde(rename = "BooleanLiteral")]
    Bool { value: bool },
    #[serde(rename = "NilLiteral")]
    Nil,
    Identifier { name: String },
    /// A call or array read. Qualified names (`M.F`, `rl.DrawText`) stay whole.
    Call { name: String, args: Vec<Expr> },
    MemberAccess { object: Box<Expr>, member: String },
    /// `expr["key"]`
    #[serde(rename = "JSONIndexAccess")]
    JsonIndex { object: Box<Expr>, key: String },
    #[serde(rename = "DictLiteral")]
    Dict { pairs: Vec<DictPair> },
    #[serde(rename = "BinaryOp")]
    Binary {
        op: String,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    #[serde(rename = "UnaryOp")]
    Unary { op: String, operand: Box<Expr> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DictPair {
    pub key: String,
    pub value: Expr,
}

impl Expr {
    pub fn number(text: impl Into<String>) -> Self {
        Expr::Number { text: text.into() }
    }

    pub fn ident(name: impl Into<String>) -> Self {
        Expr::Identifier { name: name.into() }
    }

    pub fn string(value: impl Into<String>) -> Self {
        Expr::Str {
            value: value.into(),
        }
    }

    pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Call {
            name: name.into(),
            args,
        }
    }

    pub fn binary(op: &str, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op: op.to_string(),
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Dotted path of an identifier chain (`a.b.c`), if this is one.
    pub fn dotted_path(&self) -> Option<String> {
        match self {
            Expr::Identifier { name } => Some(name.clone()),
            Expr::MemberAccess { object, member } => {
                object.dotted_path().map(|path| format!("{}.{}", path, member))
            }
            _ => None,
        }
    }
}
