use std::{fmt, sync::Arc};

use rkyv::{Archive, Deserialize, Serialize};

use crate::runtime::net::error::Error;

/// Integer id the symbol database assigns to every object type.
#[derive(
    Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[archive(check_bytes)]
pub struct ObjectTypeId(pub u32);

#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[archive(check_bytes)]
pub enum OperationKind {
    Call,
    Get,
    Set,
    Construct,
    Destroy,
}

/// Names one invocable operation: the set of types in scope, the path to the
/// target type and what is done to it.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
#[archive(check_bytes)]
pub struct InvocationId {
    pub context: Vec<ObjectTypeId>,
    pub type_path: Vec<ObjectTypeId>,
    pub operation: OperationKind,
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}(", self.operation)?;
        for (i, ty) in self.type_path.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{}", ty.0)?;
        }
        f.write_str(")")
    }
}

/// Where the code for an invocation lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvocationDescriptor {
    pub id: InvocationId,
    pub symbol: String,
    pub source: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectDescriptor {
    pub type_id: ObjectTypeId,
    pub name: String,
    pub fields: Vec<ObjectTypeId>,
}

pub trait SymbolDatabase: Send + Sync + 'static {
    fn invocation(&self, id: &InvocationId) -> Option<InvocationDescriptor>;
    fn object(&self, type_id: ObjectTypeId) -> Option<ObjectDescriptor>;
}

pub type CompiledFunction = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

pub trait CompiledModule: Send + Sync {
    fn function(&self, symbol: &str) -> Option<CompiledFunction>;
}

pub trait FunctionCompiler: Send + Sync + 'static {
    fn compile(&self, source: &str) -> Result<Box<dyn CompiledModule>, Error>;
}

/// The collaborators a process was started with. Every logical thread reaches
/// the same context through its manager.
#[derive(Clone, Default)]
pub struct RuntimeContext {
    database: Option<Arc<dyn SymbolDatabase>>,
    compiler: Option<Arc<dyn FunctionCompiler>>,
}

impl RuntimeContext {
    pub fn with_database(mut self, database: impl SymbolDatabase) -> Self {
        self.database = Some(Arc::new(database));
        self
    }

    pub fn with_compiler(mut self, compiler: impl FunctionCompiler) -> Self {
        self.compiler = Some(Arc::new(compiler));
        self
    }

    pub fn database(&self) -> Option<&dyn SymbolDatabase> {
        self.database.as_deref()
    }

    pub fn compiler(&self) -> Option<&dyn FunctionCompiler> {
        self.compiler.as_deref()
    }

    /// Looks the invocation up, compiles its source and returns the function
    /// it names.
    pub fn resolve(&self, id: &InvocationId) -> Result<CompiledFunction, Error> {
        let database = self
            .database()
            .ok_or(Error::MissingCollaborator("symbol database"))?;
        let compiler = self
            .compiler()
            .ok_or(Error::MissingCollaborator("function compiler"))?;
        let descriptor = database
            .invocation(id)
            .ok_or_else(|| Error::Rejected(format!("unknown invocation {id}")))?;
        let module = compiler.compile(&descriptor.source)?;
        module.function(&descriptor.symbol).ok_or_else(|| {
            Error::Rejected(format!("{} not found in compiled module", descriptor.symbol))
        })
    }
}
