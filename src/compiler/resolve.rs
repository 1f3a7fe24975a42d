//! Call-site resolution and host namespace flattening.
//!
//! Every call in the AST goes through [`resolve_call`] exactly once, at
//! compile time. The result decides which instruction the code generator
//! emits.

use std::collections::{BTreeMap, HashSet};

use crate::vm::{Op, builtin_arity};

/// How a call site is compiled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// `a(i, j)` on a DIM'd array of matching rank
    ArrayRead,
    /// Lowercase, module-qualified user function name
    UserCall(String),
    BuiltinCall(Op, usize),
    Print,
    MatMul,
    /// Name as passed to the foreign registry
    ForeignCall(String),
}

impl Resolution {
    /// Whether the emitted code leaves a result on the stack.
    pub fn pushes_value(&self) -> bool {
        !matches!(
            self,
            Resolution::Print | Resolution::MatMul | Resolution::BuiltinCall(Op::Quit, _)
        )
    }
}

/// Namespaces whose members are host functions.
pub const HOST_NAMESPACES: &[&str] = &["rl", "box2d", "bullet", "game"];

/// Builtin functions: lowercase name, display name, instruction.
const BUILTINS: &[(&str, &str, Op)] = &[
    ("str", "Str", Op::Str),
    ("int", "Int", Op::Int),
    ("len", "Len", Op::Len),
    ("left", "Left", Op::Left),
    ("left$", "Left$", Op::Left),
    ("right", "Right", Op::Right),
    ("right$", "Right$", Op::Right),
    ("mid", "Mid", Op::Mid),
    ("mid$", "Mid$", Op::Mid),
    ("randomn", "RandomN", Op::RandomN),
    ("timer", "Timer", Op::Timer),
    ("resettimer", "ResetTimer", Op::ResetTimer),
    ("sleep", "Sleep", Op::Sleep),
    ("wait", "Wait", Op::Sleep),
    ("sin", "Sin", Op::Sin),
    ("cos", "Cos", Op::Cos),
    ("tan", "Tan", Op::Tan),
    ("sqrt", "Sqrt", Op::Sqrt),
    ("abs", "Abs", Op::Abs),
    ("lerp", "Lerp", Op::Lerp),
    ("noise", "Noise", Op::Noise2D),
    ("noise2d", "Noise2D", Op::Noise2D),
    ("perlin", "Perlin", Op::Noise2D),
    ("simplex", "Simplex", Op::Noise2D),
    ("floor", "Floor", Op::Floor),
    ("ceil", "Ceil", Op::Ceil),
    ("round", "Round", Op::Round),
    ("min", "Min", Op::Min),
    ("max", "Max", Op::Max),
    ("clamp", "Clamp", Op::Clamp),
    ("pow", "Pow", Op::Power),
    ("exp", "Exp", Op::Exp),
    ("log", "Log", Op::Log),
    ("log10", "Log10", Op::Log10),
    ("atan2", "Atan2", Op::Atan2),
    ("sign", "Sign", Op::Sign),
    ("deg2rad", "Deg2Rad", Op::Deg2Rad),
    ("rad2deg", "Rad2Deg", Op::Rad2Deg),
    ("distance2d", "Distance2D", Op::Distance2D),
    ("distance3d", "Distance3D", Op::Distance3D),
    ("distsq2d", "DistSq2D", Op::DistSq2D),
    ("distsq3d", "DistSq3D", Op::DistSq3D),
    ("inradius2d", "InRadius2D", Op::InRadius2D),
    ("inradius3d", "InRadius3D", Op::InRadius3D),
    ("angle2d", "Angle2D", Op::Angle2D),
    ("openfile", "OpenFile", Op::OpenFile),
    ("readline", "ReadLine", Op::ReadLine),
    ("writeline", "WriteLine", Op::WriteLine),
    ("closefile", "CloseFile", Op::CloseFile),
    ("eof", "EOF", Op::Eof),
    ("quit", "Quit", Op::Quit),
];

/// Flat host names for namespaced physics calls.
const FLAT_NAMES: &[(&str, &str)] = &[
    ("box2d.createworld", "createworld2d"),
    ("box2d.destroyworld", "destroyworld2d"),
    ("box2d.step", "step2d"),
    ("box2d.createbody", "createbody2d"),
    ("box2d.destroybody", "destroybody2d"),
    ("box2d.getbodycount", "getbodycount2d"),
    ("box2d.getbodyid", "getbodyid2d"),
    ("box2d.createbodyatscreen", "createbodyatscreen2d"),
    ("box2d.getpositionx", "getpositionx2d"),
    ("box2d.getpositiony", "getpositiony2d"),
    ("box2d.getangle", "getangle2d"),
    ("box2d.setlinearvelocity", "setvelocity2d"),
    ("box2d.settransform", "settransform2d"),
    ("box2d.applyforce", "applyforce2d"),
    ("bullet.createworld", "createworld3d"),
    ("bullet.destroyworld", "destroyworld3d"),
    ("bullet.setgravity", "setworldgravity3d"),
    ("bullet.step", "step3d"),
    ("bullet.createbox", "createbox3d"),
    ("bullet.createsphere", "createsphere3d"),
    ("bullet.destroybody", "destroybody3d"),
    ("bullet.setposition", "setposition3d"),
    ("bullet.getpositionx", "getpositionx3d"),
    ("bullet.getpositiony", "getpositiony3d"),
    ("bullet.getpositionz", "getpositionz3d"),
    ("bullet.setvelocity", "setvelocity3d"),
    ("bullet.getvelocityx", "getvelocityx3d"),
    ("bullet.getvelocityy", "getvelocityy3d"),
    ("bullet.getvelocityz", "getvelocityz3d"),
    ("bullet.getrotationx", "getyaw3d"),
    ("bullet.getrotationy", "getpitch3d"),
    ("bullet.getrotationz", "getroll3d"),
    ("bullet.setrotation", "setrotation3d"),
    ("bullet.applyforce", "applyforce3d"),
    ("bullet.applycentralforce", "applyforce3d"),
    ("bullet.applyimpulse", "applyimpulse3d"),
    ("bullet.raycast", "raycastfromdir3d"),
    ("bullet.getraycasthitx", "rayhitx3d"),
    ("bullet.getraycasthity", "rayhity3d"),
    ("bullet.getraycasthitz", "rayhitz3d"),
    ("bullet.getraycasthitbody", "rayhitbody3d"),
    ("bullet.getraycasthitnormalx", "rayhitnormalx3d"),
    ("bullet.getraycasthitnormaly", "rayhitnormaly3d"),
    ("bullet.getraycasthitnormalz", "rayhitnormalz3d"),
];

fn flat_name(lower: &str) -> Option<&'static str> {
    FLAT_NAMES
        .iter()
        .find(|(qualified, _)| *qualified == lower)
        .map(|(_, flat)| *flat)
}

/// Split `ns.member` when `ns` is a host namespace.
pub fn host_namespace(lower: &str) -> Option<(&str, &str)> {
    let (ns, member) = lower.split_once('.')?;
    HOST_NAMESPACES.contains(&ns).then_some((ns, member))
}

/// Foreign name for a qualified identifier or member read such as
/// `rl.KEY_SPACE`: table lookup, otherwise the namespace prefix is dropped.
pub fn flatten_qualified(name: &str) -> String {
    let lower = name.to_lowercase();
    if let Some(flat) = flat_name(&lower) {
        return flat.to_string();
    }
    match host_namespace(&lower) {
        Some((_, member)) => member.to_string(),
        None => lower,
    }
}

/// Foreign name for a qualified call: table lookup, otherwise only `rl.`
/// is stripped.
pub fn flatten_call(name: &str) -> String {
    let lower = name.to_lowercase();
    if let Some(flat) = flat_name(&lower) {
        return flat.to_string();
    }
    match lower.strip_prefix("rl.") {
        Some(rest) => rest.to_string(),
        None => lower,
    }
}

/// Builtin lookup by (case-insensitive) name: display name and instruction.
pub fn builtin(name: &str) -> Option<(&'static str, Op)> {
    let lower = name.to_lowercase();
    BUILTINS
        .iter()
        .find(|(key, _, _)| *key == lower)
        .map(|(_, display, op)| (*display, *op))
}

fn fixed_arity(op: Op) -> usize {
    match op {
        Op::Power => 2,
        Op::Quit => 0,
        other => builtin_arity(other).unwrap_or(0),
    }
}

/// Names the resolver consults.
pub struct CallScope<'a> {
    /// Lowercase, module-qualified user function names
    pub functions: &'a HashSet<String>,
    /// Declared array dimensions by lowercase name
    pub var_dims: &'a BTreeMap<String, Vec<usize>>,
}

/// Decide how a call to `name` with `argc` arguments is compiled.
pub fn resolve_call(name: &str, argc: usize, scope: &CallScope) -> Result<Resolution, String> {
    let lower = name.to_lowercase();

    if lower.contains('.') {
        if scope.functions.contains(&lower) {
            return Ok(Resolution::UserCall(lower));
        }
        return Ok(Resolution::ForeignCall(flatten_call(&lower)));
    }

    if let Some(dims) = scope.var_dims.get(&lower)
        && dims.len() == argc
    {
        return Ok(Resolution::ArrayRead);
    }

    match lower.as_str() {
        "print" => return Ok(Resolution::Print),
        "matmul" => {
            if argc != 3 {
                return Err("MatMul() expects 3 argument(s)".to_string());
            }
            return Ok(Resolution::MatMul);
        }
        _ => {}
    }

    if scope.functions.contains(&lower) {
        return Ok(Resolution::UserCall(lower));
    }

    if lower == "random" {
        return match argc {
            0 => Ok(Resolution::BuiltinCall(Op::Random, 0)),
            1 => Ok(Resolution::BuiltinCall(Op::RandomN, 1)),
            _ => Err("Random() expects 0 or 1 argument(s)".to_string()),
        };
    }

    if let Some((display, op)) = builtin(&lower) {
        let arity = fixed_arity(op);
        if arity != argc {
            return Err(format!("{}() expects {} argument(s)", display, arity));
        }
        return Ok(Resolution::BuiltinCall(op, arity));
    }

    Ok(Resolution::ForeignCall(lower))
}
