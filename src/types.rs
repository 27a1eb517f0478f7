//! Type system
//!
//! Types are interned in a [`TypeRegistry`]; a [`TypeId`] is the only way
//! types are referenced and two types are equal iff their ids are equal,
//! which by interning means their codenames are equal. The codename is the
//! stable identifier the C emitter uses.
//!
//! Structural types (pointers, arrays, optionals, function types) intern by
//! their shape. User-declared records, unions and enums intern by identity:
//! every declaration mints a fresh codename, so two records with identical
//! fields are still distinct types.

use crate::ast::NodeId;
use crate::scope::SymbolId;
use std::collections::HashMap;
use std::fmt::Write as _;

/// Index into the type registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeId(pub u32);

/// Integer widths (signed and unsigned share this)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntKind {
    I8,
    I16,
    I32,
    I64,
    ISize,
}

impl IntKind {
    pub fn bits(self) -> u32 {
        match self {
            IntKind::I8 => 8,
            IntKind::I16 => 16,
            IntKind::I32 => 32,
            IntKind::I64 | IntKind::ISize => 64,
        }
    }

    fn from_bits(bits: u32) -> IntKind {
        match bits {
            8 => IntKind::I8,
            16 => IntKind::I16,
            32 => IntKind::I32,
            _ => IntKind::I64,
        }
    }
}

/// Float widths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FloatKind {
    F32,
    F64,
    F128,
}

impl FloatKind {
    pub fn bits(self) -> u32 {
        match self {
            FloatKind::F32 => 32,
            FloatKind::F64 => 64,
            FloatKind::F128 => 128,
        }
    }
}

/// A record or union field
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub ty: TypeId,
}

/// Record type payload
#[derive(Debug, Clone, Default)]
pub struct RecordInfo {
    pub fields: Vec<Field>,
    /// Metafields: `__destroy`, `__copy`, `__convert`, operators, ...
    pub metafields: HashMap<String, SymbolId>,
    pub packed: bool,
    pub aligned: Option<u32>,
}

/// Union type payload
#[derive(Debug, Clone, Default)]
pub struct UnionInfo {
    pub variants: Vec<Field>,
    pub metafields: HashMap<String, SymbolId>,
}

/// Enum type payload
#[derive(Debug, Clone)]
pub struct EnumInfo {
    pub subtype: TypeId,
    pub fields: Vec<(String, i64)>,
    pub metafields: HashMap<String, SymbolId>,
}

/// Function type payload
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionInfo {
    pub args: Vec<TypeId>,
    pub rets: Vec<TypeId>,
    pub variadic: bool,
}

/// One specialization of a polymorphic function
#[derive(Debug, Clone)]
pub struct PolyEval {
    /// Argument-type key this eval was instantiated for
    pub key: Vec<TypeId>,
    /// The specialized (cloned and re-analyzed) function node
    pub node: NodeId,
    /// The concrete function type of the specialization
    pub ty: TypeId,
    /// The mangled name the emitter uses for this specialization
    pub name: String,
}

/// Polymorphic function payload. Evals are ordered; lookup returns the
/// first exact key match (first-registered wins).
#[derive(Debug, Clone, Default)]
pub struct PolyInfo {
    pub args: Vec<TypeId>,
    pub rets: Vec<TypeId>,
    pub evals: Vec<PolyEval>,
}

/// Generic type payload: not a concrete type until invoked
#[derive(Debug, Clone)]
pub struct GenericInfo {
    pub name: String,
    pub params: Vec<String>,
    pub node: NodeId,
    /// Materialized instantiations, keyed by argument tuple
    pub cache: Vec<(Vec<TypeId>, TypeId)>,
    /// Set while an instantiation is in progress, to detect cycles
    pub expanding: bool,
}

/// The kind of a type
#[derive(Debug, Clone)]
pub enum TypeKind {
    Int(IntKind),
    Uint(IntKind),
    Float(FloatKind),
    Boolean,
    Character,
    String,
    Cstring,
    /// Pointer; `None` is the generic untyped pointer
    Pointer(Option<TypeId>),
    Nilptr,
    Niltype,
    Any,
    Void,
    /// Placeholder argument type of polymorphic functions
    Auto,
    /// The type of types (what a `@T` expression evaluates to)
    TypeType,
    /// Type of values that only exist at compile time
    Comptime,
    Array { elem: TypeId, len: u64 },
    Record(RecordInfo),
    Union(UnionInfo),
    Enum(EnumInfo),
    Function(FunctionInfo),
    Polyfunction(PolyInfo),
    Generic(GenericInfo),
    Optional(TypeId),
}

/// An interned type
#[derive(Debug, Clone)]
pub struct Type {
    pub kind: TypeKind,
    /// Stable identifier used as the C name; the intern key
    pub codename: String,
    /// Declared nickname (type symbol name), preferred for display
    pub nickname: Option<String>,
}

/// Handles to the pre-interned primitive types
#[derive(Debug, Clone, Copy)]
pub struct PrimTypes {
    pub int8: TypeId,
    pub int16: TypeId,
    pub int32: TypeId,
    pub int64: TypeId,
    pub isize: TypeId,
    pub uint8: TypeId,
    pub uint16: TypeId,
    pub uint32: TypeId,
    pub uint64: TypeId,
    pub usize: TypeId,
    pub float32: TypeId,
    pub float64: TypeId,
    pub float128: TypeId,
    pub boolean: TypeId,
    pub character: TypeId,
    pub string: TypeId,
    pub cstring: TypeId,
    pub pointer: TypeId,
    pub nilptr: TypeId,
    pub niltype: TypeId,
    pub any: TypeId,
    pub void: TypeId,
    pub auto: TypeId,
    pub typetype: TypeId,
    pub comptime: TypeId,
}

/// The type registry: the single owner of all interned types
#[derive(Debug)]
pub struct TypeRegistry {
    types: Vec<Type>,
    by_codename: HashMap<String, TypeId>,
    pub prims: PrimTypes,
    /// Counter minting unique codenames for anonymous user types
    anon_counter: u32,
}

impl TypeRegistry {
    pub fn new() -> Self {
        let mut reg = Self {
            types: Vec::new(),
            by_codename: HashMap::new(),
            prims: PrimTypes {
                int8: TypeId(0),
                int16: TypeId(0),
                int32: TypeId(0),
                int64: TypeId(0),
                isize: TypeId(0),
                uint8: TypeId(0),
                uint16: TypeId(0),
                uint32: TypeId(0),
                uint64: TypeId(0),
                usize: TypeId(0),
                float32: TypeId(0),
                float64: TypeId(0),
                float128: TypeId(0),
                boolean: TypeId(0),
                character: TypeId(0),
                string: TypeId(0),
                cstring: TypeId(0),
                pointer: TypeId(0),
                nilptr: TypeId(0),
                niltype: TypeId(0),
                any: TypeId(0),
                void: TypeId(0),
                auto: TypeId(0),
                typetype: TypeId(0),
                comptime: TypeId(0),
            },
            anon_counter: 0,
        };
        reg.prims = PrimTypes {
            int8: reg.intern("int8", TypeKind::Int(IntKind::I8)),
            int16: reg.intern("int16", TypeKind::Int(IntKind::I16)),
            int32: reg.intern("int32", TypeKind::Int(IntKind::I32)),
            int64: reg.intern("int64", TypeKind::Int(IntKind::I64)),
            isize: reg.intern("isize", TypeKind::Int(IntKind::ISize)),
            uint8: reg.intern("uint8", TypeKind::Uint(IntKind::I8)),
            uint16: reg.intern("uint16", TypeKind::Uint(IntKind::I16)),
            uint32: reg.intern("uint32", TypeKind::Uint(IntKind::I32)),
            uint64: reg.intern("uint64", TypeKind::Uint(IntKind::I64)),
            usize: reg.intern("usize", TypeKind::Uint(IntKind::ISize)),
            float32: reg.intern("float32", TypeKind::Float(FloatKind::F32)),
            float64: reg.intern("float64", TypeKind::Float(FloatKind::F64)),
            float128: reg.intern("float128", TypeKind::Float(FloatKind::F128)),
            boolean: reg.intern("boolean", TypeKind::Boolean),
            character: reg.intern("character", TypeKind::Character),
            string: reg.intern("nlstring", TypeKind::String),
            cstring: reg.intern("cstring", TypeKind::Cstring),
            pointer: reg.intern("nlpointer", TypeKind::Pointer(None)),
            nilptr: reg.intern("nlnilptr", TypeKind::Nilptr),
            niltype: reg.intern("nlniltype", TypeKind::Niltype),
            any: reg.intern("nlany", TypeKind::Any),
            void: reg.intern("void", TypeKind::Void),
            auto: reg.intern("nlauto", TypeKind::Auto),
            typetype: reg.intern("nltype", TypeKind::TypeType),
            comptime: reg.intern("nlcomptime", TypeKind::Comptime),
        };
        reg
    }

    fn intern(&mut self, codename: &str, kind: TypeKind) -> TypeId {
        if let Some(&id) = self.by_codename.get(codename) {
            return id;
        }
        let id = TypeId(self.types.len() as u32);
        self.types.push(Type {
            kind,
            codename: codename.to_string(),
            nickname: None,
        });
        self.by_codename.insert(codename.to_string(), id);
        id
    }

    pub fn get(&self, id: TypeId) -> &Type {
        &self.types[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: TypeId) -> &mut Type {
        &mut self.types[id.0 as usize]
    }

    pub fn codename(&self, id: TypeId) -> &str {
        &self.get(id).codename
    }

    pub fn by_codename(&self, codename: &str) -> Option<TypeId> {
        self.by_codename.get(codename).copied()
    }

    /// Iterate all interned types in creation order
    pub fn iter(&self) -> impl Iterator<Item = (TypeId, &Type)> {
        self.types
            .iter()
            .enumerate()
            .map(|(i, t)| (TypeId(i as u32), t))
    }

    // ============ Structural constructors (interned by shape) ============

    pub fn pointer_to(&mut self, sub: TypeId) -> TypeId {
        let codename = format!("ptr_{}", self.codename(sub));
        self.intern(&codename, TypeKind::Pointer(Some(sub)))
    }

    pub fn array_of(&mut self, elem: TypeId, len: u64) -> TypeId {
        let codename = format!("arr{}_{}", len, self.codename(elem));
        self.intern(&codename, TypeKind::Array { elem, len })
    }

    pub fn optional_of(&mut self, sub: TypeId) -> TypeId {
        let codename = format!("opt_{}", self.codename(sub));
        self.intern(&codename, TypeKind::Optional(sub))
    }

    pub fn function_of(&mut self, args: Vec<TypeId>, rets: Vec<TypeId>, variadic: bool) -> TypeId {
        let mut codename = String::from("func");
        for &a in &args {
            let _ = write!(codename, "_{}", self.codename(a));
        }
        if variadic {
            codename.push_str("_va");
        }
        codename.push_str("_to");
        for &r in &rets {
            let _ = write!(codename, "_{}", self.codename(r));
        }
        self.intern(&codename, TypeKind::Function(FunctionInfo { args, rets, variadic }))
    }

    // ============ Identity constructors (fresh codename per declaration) ============

    fn mint_codename(&mut self, prefix: &str, nickname: Option<&str>) -> String {
        match nickname {
            Some(nick) if !self.by_codename.contains_key(nick) => nick.to_string(),
            _ => {
                self.anon_counter += 1;
                format!("{}_{}", prefix, self.anon_counter)
            }
        }
    }

    pub fn declare_record(&mut self, nickname: Option<&str>, info: RecordInfo) -> TypeId {
        let codename = self.mint_codename("nlrecord", nickname);
        let id = self.intern(&codename, TypeKind::Record(info));
        self.get_mut(id).nickname = nickname.map(str::to_string);
        id
    }

    pub fn declare_union(&mut self, nickname: Option<&str>, info: UnionInfo) -> TypeId {
        let codename = self.mint_codename("nlunion", nickname);
        let id = self.intern(&codename, TypeKind::Union(info));
        self.get_mut(id).nickname = nickname.map(str::to_string);
        id
    }

    pub fn declare_enum(&mut self, nickname: Option<&str>, info: EnumInfo) -> TypeId {
        let codename = self.mint_codename("nlenum", nickname);
        let id = self.intern(&codename, TypeKind::Enum(info));
        self.get_mut(id).nickname = nickname.map(str::to_string);
        id
    }

    pub fn declare_polyfunction(&mut self, nickname: Option<&str>, info: PolyInfo) -> TypeId {
        let codename = self.mint_codename("nlpolyfunc", nickname);
        let id = self.intern(&codename, TypeKind::Polyfunction(info));
        self.get_mut(id).nickname = nickname.map(str::to_string);
        id
    }

    pub fn declare_generic(&mut self, info: GenericInfo) -> TypeId {
        let codename = self.mint_codename("nlgeneric", Some(&info.name.clone()));
        let id = self.intern(&codename, TypeKind::Generic(info));
        id
    }

    /// Rename an identity type after its declaring symbol. The codename
    /// moves too when the nickname is still free, so the emitted C carries
    /// the user's name.
    pub fn adopt_nickname(&mut self, id: TypeId, name: &str) {
        if self.get(id).nickname.is_some() {
            return;
        }
        if !self.by_codename.contains_key(name) {
            let old = self.get(id).codename.clone();
            self.by_codename.remove(&old);
            self.by_codename.insert(name.to_string(), id);
            self.get_mut(id).codename = name.to_string();
        }
        self.get_mut(id).nickname = Some(name.to_string());
    }

    pub fn set_record_fields(&mut self, id: TypeId, fields: Vec<Field>) {
        if let TypeKind::Record(info) = &mut self.get_mut(id).kind {
            info.fields = fields;
        }
    }

    pub fn set_union_variants(&mut self, id: TypeId, variants: Vec<Field>) {
        if let TypeKind::Union(info) = &mut self.get_mut(id).kind {
            info.variants = variants;
        }
    }

    pub fn set_enum_info(&mut self, id: TypeId, subtype: TypeId, fields: Vec<(String, i64)>) {
        if let TypeKind::Enum(info) = &mut self.get_mut(id).kind {
            info.subtype = subtype;
            info.fields = fields;
        }
    }

    /// Resolve a primitive type from its language name
    pub fn resolve_primitive(&self, name: &str) -> Option<TypeId> {
        let p = &self.prims;
        Some(match name {
            "int8" => p.int8,
            "int16" => p.int16,
            "int32" => p.int32,
            "int64" | "integer" => p.int64,
            "isize" => p.isize,
            "uint8" | "byte" => p.uint8,
            "uint16" => p.uint16,
            "uint32" => p.uint32,
            "uint64" => p.uint64,
            "usize" => p.usize,
            "float32" => p.float32,
            "float64" | "number" => p.float64,
            "float128" => p.float128,
            "boolean" => p.boolean,
            "character" => p.character,
            "string" => p.string,
            "cstring" => p.cstring,
            "pointer" => p.pointer,
            "nilptr" => p.nilptr,
            "niltype" => p.niltype,
            "any" => p.any,
            "void" => p.void,
            "auto" => p.auto,
            "type" => p.typetype,
            _ => return None,
        })
    }

    // ============ Predicates ============

    pub fn is_integer(&self, id: TypeId) -> bool {
        matches!(self.get(id).kind, TypeKind::Int(_) | TypeKind::Uint(_))
    }

    pub fn is_signed(&self, id: TypeId) -> bool {
        matches!(self.get(id).kind, TypeKind::Int(_))
    }

    pub fn is_float(&self, id: TypeId) -> bool {
        matches!(self.get(id).kind, TypeKind::Float(_))
    }

    pub fn is_numeric(&self, id: TypeId) -> bool {
        self.is_integer(id) || self.is_float(id)
    }

    pub fn is_boolean(&self, id: TypeId) -> bool {
        matches!(self.get(id).kind, TypeKind::Boolean)
    }

    pub fn is_pointer(&self, id: TypeId) -> bool {
        matches!(self.get(id).kind, TypeKind::Pointer(_) | TypeKind::Nilptr)
    }

    pub fn is_auto(&self, id: TypeId) -> bool {
        matches!(self.get(id).kind, TypeKind::Auto)
    }

    pub fn is_polyfunction(&self, id: TypeId) -> bool {
        matches!(self.get(id).kind, TypeKind::Polyfunction(_))
    }

    /// Integer range of an integral type
    pub fn int_range(&self, id: TypeId) -> Option<(i128, i128)> {
        match self.get(id).kind {
            TypeKind::Int(k) => {
                let bits = k.bits();
                Some((-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1))
            }
            TypeKind::Uint(k) => {
                let bits = k.bits();
                Some((0, (1i128 << bits) - 1))
            }
            TypeKind::Enum(ref info) => self.int_range(info.subtype),
            _ => None,
        }
    }

    /// Whether an integer constant fits the target integral type
    pub fn int_fits(&self, value: i128, id: TypeId) -> bool {
        match self.int_range(id) {
            Some((lo, hi)) => value >= lo && value <= hi,
            None => false,
        }
    }

    /// Look up a metafield on a record, union or enum type
    pub fn metafield(&self, id: TypeId, name: &str) -> Option<SymbolId> {
        match &self.get(id).kind {
            TypeKind::Record(info) => info.metafields.get(name).copied(),
            TypeKind::Union(info) => info.metafields.get(name).copied(),
            TypeKind::Enum(info) => info.metafields.get(name).copied(),
            _ => None,
        }
    }

    pub fn set_metafield(&mut self, id: TypeId, name: &str, symbol: SymbolId) {
        let metafields = match &mut self.get_mut(id).kind {
            TypeKind::Record(info) => &mut info.metafields,
            TypeKind::Union(info) => &mut info.metafields,
            TypeKind::Enum(info) => &mut info.metafields,
            _ => return,
        };
        metafields.insert(name.to_string(), symbol);
    }

    /// Whether values of this type need a destructor call on scope exit,
    /// directly or through a field.
    pub fn has_destroy(&self, id: TypeId) -> bool {
        match &self.get(id).kind {
            TypeKind::Record(info) => {
                info.metafields.contains_key("__destroy")
                    || info.fields.iter().any(|f| f.ty != id && self.has_destroy(f.ty))
            }
            TypeKind::Union(info) => info.metafields.contains_key("__destroy")
                || info.variants.iter().any(|f| f.ty != id && self.has_destroy(f.ty)),
            TypeKind::Array { elem, .. } => self.has_destroy(*elem),
            TypeKind::Optional(sub) => self.has_destroy(*sub),
            _ => false,
        }
    }

    /// Whether this type defines a `__copy` metafield, directly or through
    /// a field.
    pub fn has_copy(&self, id: TypeId) -> bool {
        match &self.get(id).kind {
            TypeKind::Record(info) => {
                info.metafields.contains_key("__copy")
                    || info.fields.iter().any(|f| f.ty != id && self.has_copy(f.ty))
            }
            TypeKind::Array { elem, .. } => self.has_copy(*elem),
            TypeKind::Optional(sub) => self.has_copy(*sub),
            _ => false,
        }
    }

    /// Whether static storage of this type must be registered as a GC root
    /// (it can hold managed pointers).
    pub fn has_gc_pointers(&self, id: TypeId) -> bool {
        match &self.get(id).kind {
            TypeKind::Pointer(_) | TypeKind::String | TypeKind::Any => true,
            TypeKind::Record(info) => info.fields.iter().any(|f| f.ty != id && self.has_gc_pointers(f.ty)),
            TypeKind::Union(info) => info.variants.iter().any(|f| f.ty != id && self.has_gc_pointers(f.ty)),
            TypeKind::Array { elem, .. } => self.has_gc_pointers(*elem),
            TypeKind::Optional(sub) => self.has_gc_pointers(*sub),
            _ => false,
        }
    }

    /// Human-readable type name for diagnostics
    pub fn display(&self, id: TypeId) -> String {
        let ty = self.get(id);
        if let Some(nick) = &ty.nickname {
            return nick.clone();
        }
        match &ty.kind {
            TypeKind::Int(_) | TypeKind::Uint(_) | TypeKind::Float(_) => ty.codename.clone(),
            TypeKind::Boolean => "boolean".into(),
            TypeKind::Character => "character".into(),
            TypeKind::String => "string".into(),
            TypeKind::Cstring => "cstring".into(),
            TypeKind::Pointer(None) => "pointer".into(),
            TypeKind::Pointer(Some(sub)) => format!("*{}", self.display(*sub)),
            TypeKind::Nilptr => "nilptr".into(),
            TypeKind::Niltype => "niltype".into(),
            TypeKind::Any => "any".into(),
            TypeKind::Void => "void".into(),
            TypeKind::Auto => "auto".into(),
            TypeKind::TypeType => "type".into(),
            TypeKind::Comptime => "comptime".into(),
            TypeKind::Array { elem, len } => format!("[{}]{}", len, self.display(*elem)),
            TypeKind::Record(_) => ty.codename.clone(),
            TypeKind::Union(_) => ty.codename.clone(),
            TypeKind::Enum(_) => ty.codename.clone(),
            TypeKind::Function(info) => {
                let args: Vec<_> = info.args.iter().map(|&a| self.display(a)).collect();
                let rets: Vec<_> = info.rets.iter().map(|&r| self.display(r)).collect();
                format!("function({}): ({})", args.join(", "), rets.join(", "))
            }
            TypeKind::Polyfunction(_) => format!("polyfunction {}", ty.codename),
            TypeKind::Generic(info) => format!("generic {}", info.name),
            TypeKind::Optional(sub) => format!("?{}", self.display(*sub)),
        }
    }

    // ============ Assignability & promotion ============

    /// Whether a value of type `from` (with optionally known compile-time
    /// value) is implicitly assignable to `to`.
    pub fn assignable(&self, from: TypeId, to: TypeId, value: Option<&crate::ast::CompVal>) -> bool {
        if from == to {
            return true;
        }
        let to_kind = &self.get(to).kind;
        let from_kind = &self.get(from).kind;
        match (from_kind, to_kind) {
            // everything goes into `any`
            (_, TypeKind::Any) => true,
            // nil into optionals
            (TypeKind::Niltype, TypeKind::Optional(_)) => true,
            // a value goes into its optional wrapper
            (_, TypeKind::Optional(sub)) => self.assignable(from, *sub, value),
            // nilptr into any pointer
            (TypeKind::Nilptr, TypeKind::Pointer(_)) => true,
            // pointer lattice: equal pointee, or the generic pointer
            (TypeKind::Pointer(_), TypeKind::Pointer(None)) => true,
            (TypeKind::Pointer(Some(a)), TypeKind::Pointer(Some(b))) => a == b,
            // integer widening when the range is contained, or a literal fits
            (TypeKind::Int(_) | TypeKind::Uint(_), TypeKind::Int(_) | TypeKind::Uint(_)) => {
                if let Some(crate::ast::CompVal::Int(v)) = value {
                    return self.int_fits(*v, to);
                }
                let (flo, fhi) = self.int_range(from).unwrap();
                let (tlo, thi) = self.int_range(to).unwrap();
                tlo <= flo && fhi <= thi
            }
            // integers promote to floats, narrower floats widen
            (TypeKind::Int(_) | TypeKind::Uint(_), TypeKind::Float(_)) => true,
            (TypeKind::Float(a), TypeKind::Float(b)) => a.bits() <= b.bits(),
            // enums coerce to their subtype
            (TypeKind::Enum(info), _) => self.assignable(info.subtype, to, value),
            // string into cstring is allowed implicitly
            (TypeKind::String, TypeKind::Cstring) => true,
            _ => {
                // `__convert` metafield on the target accepting anything
                self.metafield(to, "__convert").is_some()
            }
        }
    }

    /// Result type of binary arithmetic between two numeric types.
    /// Two integers yield the smallest integer containing both ranges
    /// (signed wins ties; unsigned only when both are unsigned); a float
    /// operand promotes the result to the wider float.
    pub fn arith_common(&self, lhs: TypeId, rhs: TypeId) -> Option<TypeId> {
        if !self.is_numeric(lhs) || !self.is_numeric(rhs) {
            return None;
        }
        let p = &self.prims;
        if self.is_float(lhs) || self.is_float(rhs) {
            let bits = |id: TypeId| match self.get(id).kind {
                TypeKind::Float(k) => k.bits(),
                _ => 0,
            };
            let widest = bits(lhs).max(bits(rhs));
            return Some(match widest {
                32 => p.float32,
                128 => p.float128,
                _ => p.float64,
            });
        }
        let (lsigned, lbits) = match self.get(lhs).kind {
            TypeKind::Int(k) => (true, k.bits()),
            TypeKind::Uint(k) => (false, k.bits()),
            _ => return None,
        };
        let (rsigned, rbits) = match self.get(rhs).kind {
            TypeKind::Int(k) => (true, k.bits()),
            TypeKind::Uint(k) => (false, k.bits()),
            _ => return None,
        };
        if !lsigned && !rsigned {
            let bits = lbits.max(rbits);
            return Some(self.uint_of_bits(bits));
        }
        // Mixed or both signed: result is signed and must contain the
        // unsigned operand's range, capped at 64 bits.
        let need = |signed: bool, bits: u32| if signed { bits } else { bits * 2 };
        let bits = need(lsigned, lbits).max(need(rsigned, rbits)).min(64);
        Some(self.int_of_bits(bits))
    }

    fn int_of_bits(&self, bits: u32) -> TypeId {
        let p = &self.prims;
        match IntKind::from_bits(bits) {
            IntKind::I8 => p.int8,
            IntKind::I16 => p.int16,
            IntKind::I32 => p.int32,
            _ => p.int64,
        }
    }

    fn uint_of_bits(&self, bits: u32) -> TypeId {
        let p = &self.prims;
        match IntKind::from_bits(bits) {
            IntKind::I8 => p.uint8,
            IntKind::I16 => p.uint16,
            IntKind::I32 => p.uint32,
            _ => p.uint64,
        }
    }

    /// Result type of a binary operator over the given operand types, or
    /// `None` when the operator does not apply.
    pub fn binary_result(&self, op: &str, lhs: TypeId, rhs: TypeId) -> Option<TypeId> {
        let p = &self.prims;
        match op {
            "add" | "sub" | "mul" => self.arith_common(lhs, rhs),
            // `/` always promotes integers to the default float
            "div" => {
                if self.is_integer(lhs) && self.is_integer(rhs) {
                    Some(p.float64)
                } else {
                    self.arith_common(lhs, rhs)
                }
            }
            // `//` and `%` stay integral when both operands are
            "idiv" | "mod" => self.arith_common(lhs, rhs),
            "pow" => {
                if self.is_numeric(lhs) && self.is_numeric(rhs) {
                    Some(p.float64)
                } else {
                    None
                }
            }
            // shifts keep the left operand's type
            "shl" | "shr" => {
                if self.is_integer(lhs) && self.is_integer(rhs) {
                    Some(lhs)
                } else {
                    None
                }
            }
            // bitwise requires integers
            "band" | "bor" | "bxor" => {
                if self.is_integer(lhs) && self.is_integer(rhs) {
                    self.arith_common(lhs, rhs)
                } else {
                    None
                }
            }
            "eq" | "ne" | "lt" | "le" | "gt" | "ge" => Some(p.boolean),
            "concat" => {
                if matches!(self.get(lhs).kind, TypeKind::String | TypeKind::Cstring)
                    || matches!(self.get(rhs).kind, TypeKind::String | TypeKind::Cstring)
                {
                    Some(p.string)
                } else {
                    None
                }
            }
            // non-boolean and/or select one of the operand types
            "and" | "or" => {
                if lhs == rhs {
                    Some(lhs)
                } else if self.is_boolean(lhs) && self.is_boolean(rhs) {
                    Some(p.boolean)
                } else {
                    self.arith_common(lhs, rhs)
                }
            }
            _ => None,
        }
    }

    /// The metafield name implementing a binary operator, if overridable
    pub fn binop_metafield(op: &str) -> Option<&'static str> {
        Some(match op {
            "add" => "__add",
            "sub" => "__sub",
            "mul" => "__mul",
            "div" => "__div",
            "idiv" => "__idiv",
            "mod" => "__mod",
            "pow" => "__pow",
            "concat" => "__concat",
            "eq" => "__eq",
            "lt" => "__lt",
            "le" => "__le",
            _ => return None,
        })
    }

    // ============ Poly evals & generics ============

    /// Find an existing eval by exact argument-type key
    pub fn find_eval(&self, poly: TypeId, key: &[TypeId]) -> Option<PolyEval> {
        match &self.get(poly).kind {
            TypeKind::Polyfunction(info) => {
                info.evals.iter().find(|e| e.key == key).cloned()
            }
            _ => None,
        }
    }

    pub fn add_eval(&mut self, poly: TypeId, eval: PolyEval) {
        if let TypeKind::Polyfunction(info) = &mut self.get_mut(poly).kind {
            info.evals.push(eval);
        }
    }

    /// Finalize the concrete type of an in-progress eval
    pub fn update_eval(&mut self, poly: TypeId, key: &[TypeId], ty: TypeId) {
        if let TypeKind::Polyfunction(info) = &mut self.get_mut(poly).kind {
            if let Some(eval) = info.evals.iter_mut().find(|e| e.key == key) {
                eval.ty = ty;
            }
        }
    }

    /// Find a cached generic instantiation
    pub fn find_generic_instance(&self, generic: TypeId, args: &[TypeId]) -> Option<TypeId> {
        match &self.get(generic).kind {
            TypeKind::Generic(info) => info
                .cache
                .iter()
                .find(|(key, _)| key.as_slice() == args)
                .map(|&(_, id)| id),
            _ => None,
        }
    }

    pub fn cache_generic_instance(&mut self, generic: TypeId, args: Vec<TypeId>, instance: TypeId) {
        if let TypeKind::Generic(info) = &mut self.get_mut(generic).kind {
            info.cache.push((args, instance));
        }
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_is_by_codename() {
        let mut reg = TypeRegistry::new();
        let p1 = reg.pointer_to(reg.prims.int64);
        let p2 = reg.pointer_to(reg.prims.int64);
        assert_eq!(p1, p2);
        assert_eq!(reg.codename(p1), "ptr_int64");

        let a1 = reg.array_of(reg.prims.uint8, 4);
        let a2 = reg.array_of(reg.prims.uint8, 4);
        let a3 = reg.array_of(reg.prims.uint8, 8);
        assert_eq!(a1, a2);
        assert_ne!(a1, a3);
    }

    #[test]
    fn test_records_are_identity_types() {
        let mut reg = TypeRegistry::new();
        let int64 = reg.prims.int64;
        let fields = vec![Field { name: "x".into(), ty: int64 }];
        let r1 = reg.declare_record(Some("P"), RecordInfo { fields: fields.clone(), ..Default::default() });
        let r2 = reg.declare_record(Some("Q"), RecordInfo { fields, ..Default::default() });
        assert_ne!(r1, r2);
        assert_eq!(reg.codename(r1), "P");
    }

    #[test]
    fn test_integer_promotion() {
        let reg = TypeRegistry::new();
        let p = reg.prims;
        // same signedness widens
        assert_eq!(reg.arith_common(p.int8, p.int32), Some(p.int32));
        assert_eq!(reg.arith_common(p.uint8, p.uint16), Some(p.uint16));
        // mixed signedness goes signed, wide enough for the unsigned side
        assert_eq!(reg.arith_common(p.int8, p.uint8), Some(p.int16));
        assert_eq!(reg.arith_common(p.int64, p.uint32), Some(p.int64));
        // float wins
        assert_eq!(reg.arith_common(p.int64, p.float32), Some(p.float32));
        assert_eq!(reg.arith_common(p.float32, p.float64), Some(p.float64));
    }

    #[test]
    fn test_division_promotes_to_float() {
        let reg = TypeRegistry::new();
        let p = reg.prims;
        assert_eq!(reg.binary_result("div", p.int64, p.int64), Some(p.float64));
        assert_eq!(reg.binary_result("idiv", p.int64, p.int64), Some(p.int64));
        assert_eq!(reg.binary_result("mod", p.int32, p.int32), Some(p.int32));
    }

    #[test]
    fn test_shift_keeps_left_type() {
        let reg = TypeRegistry::new();
        let p = reg.prims;
        assert_eq!(reg.binary_result("shl", p.uint8, p.int64), Some(p.uint8));
        assert_eq!(reg.binary_result("shr", p.int32, p.uint8), Some(p.int32));
    }

    #[test]
    fn test_assignability() {
        let mut reg = TypeRegistry::new();
        let p = reg.prims;
        assert!(reg.assignable(p.int32, p.int64, None));
        assert!(!reg.assignable(p.int64, p.int32, None));
        // a literal that fits narrows fine
        assert!(reg.assignable(p.int64, p.int32, Some(&crate::ast::CompVal::Int(100))));
        assert!(!reg.assignable(p.int64, p.int8, Some(&crate::ast::CompVal::Int(1000))));
        // any accepts everything
        assert!(reg.assignable(p.boolean, p.any, None));
        // pointers
        let pi = reg.pointer_to(p.int64);
        let pb = reg.pointer_to(p.boolean);
        assert!(reg.assignable(pi, p.pointer, None));
        assert!(!reg.assignable(pi, pb, None));
        assert!(reg.assignable(p.nilptr, pi, None));
        // optionals
        let oi = reg.optional_of(p.int64);
        assert!(reg.assignable(p.niltype, oi, None));
        assert!(reg.assignable(p.int64, oi, None));
        assert!(!reg.assignable(p.boolean, oi, None));
    }

    #[test]
    fn test_destroy_propagates_through_fields() {
        let mut reg = TypeRegistry::new();
        let p = reg.prims;
        let inner = reg.declare_record(Some("Inner"), RecordInfo::default());
        reg.set_metafield(inner, "__destroy", crate::scope::SymbolId(0));
        let outer = reg.declare_record(
            Some("Outer"),
            RecordInfo {
                fields: vec![Field { name: "i".into(), ty: inner }],
                ..Default::default()
            },
        );
        let plain = reg.declare_record(
            Some("Plain"),
            RecordInfo {
                fields: vec![Field { name: "x".into(), ty: p.int64 }],
                ..Default::default()
            },
        );
        assert!(reg.has_destroy(inner));
        assert!(reg.has_destroy(outer));
        assert!(!reg.has_destroy(plain));
    }

    #[test]
    fn test_poly_eval_first_registered_wins() {
        let mut reg = TypeRegistry::new();
        let p = reg.prims;
        let poly = reg.declare_polyfunction(Some("f"), PolyInfo {
            args: vec![p.auto],
            rets: vec![],
            evals: Vec::new(),
        });
        let fty = reg.function_of(vec![p.int64], vec![p.int64], false);
        reg.add_eval(poly, PolyEval {
            key: vec![p.int64],
            node: NodeId(0),
            ty: fty,
            name: "f_1".into(),
        });
        reg.add_eval(poly, PolyEval {
            key: vec![p.int64],
            node: NodeId(1),
            ty: fty,
            name: "f_2".into(),
        });
        let found = reg.find_eval(poly, &[p.int64]).unwrap();
        assert_eq!(found.name, "f_1");
    }
}
