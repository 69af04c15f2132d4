//! Second compile phase: synthesize WGSL and binding data per program unit.
//!
//! Each leaf contributes its patched entry point, preceded by the
//! module-scope declarations of its arguments. Argument variables are named
//! `<entry>__<argument>` and the entry point's own references are rewritten
//! to match, so leaves that reuse argument names never collide.
//!
//! Output shape of a unit: struct declarations, the caller's library text,
//! then one block per leaf.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use kiln_core::argument::{ArgumentKind, BufferSpace, IndexSpace, TextureAccess};
use kiln_core::grid::{self, GridPlan};
use kiln_core::patcher::{self, FunctionPatch, FunctionRole, FunctionSpan};
use kiln_core::resource::SampleKind;
use kiln_core::{
    Argument, BufferHandle, BufferUsage, BytesSource, CompileError, DeviceCaps, FormatPolicy,
    GpuType, ResourceTable, ScalarType, SymbolTable, TextureDimension, TextureHandle, TextureRef,
    TextureUsage,
};

use crate::binding::{
    ArgumentBufferId, ArgumentBufferLayout, BindingKind, BindingSource, BindingSpec,
    GroupBinding, GroupSpec, LayoutEntry, StageMask,
};
use crate::component::{Blit, BlitOp, Dispatch, Draw, Program, VendorFilter, VertexCount};
use crate::flatten::{flatten, FlatUnit, LeafId, LeafNode, UnitId};
use crate::gpu::Gpu;

/// Name of the grid extent uniform inside a kernel body.
pub const GRID_SIZE: &str = "grid_size";
/// Name of the workgroup size constant inside a kernel body.
pub const THREADS_PER_GROUP: &str = "threads_per_group";

#[derive(Debug, Clone, Copy, Default)]
pub struct CompileOptions {
    pub caps: DeviceCaps,
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CompiledUnit {
    pub label: String,
    pub source: String,
    pub structs: Vec<String>,
    pub entries: Vec<String>,
}

/// A host value uploaded to a uniform block owned by the pass.
#[derive(Clone)]
pub struct BytesSlot {
    pub name: String,
    pub size: u64,
    pub source: Arc<dyn BytesSource>,
}

impl fmt::Debug for BytesSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BytesSlot")
            .field("name", &self.name)
            .field("size", &self.size)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct CompiledDispatch {
    pub unit: UnitId,
    pub entry: String,
    /// Bind groups by group number.
    pub groups: Vec<GroupBinding>,
    pub bytes: Vec<BytesSlot>,
    pub grid: GridPlan,
}

#[derive(Debug, Clone)]
pub struct CompiledDraw {
    pub unit: UnitId,
    pub vertex_entry: String,
    pub fragment_entry: String,
    pub groups: Vec<GroupBinding>,
    pub bytes: Vec<BytesSlot>,
}

#[derive(Debug, Clone)]
pub enum CompiledLeaf {
    Dispatch(CompiledDispatch),
    Draw(CompiledDraw),
    /// Blits, filters and callbacks: no generated code.
    Host,
}

/// Every resource the program touches, once per handle, with merged usage.
#[derive(Debug, Clone, Default)]
pub struct ResourceUsage {
    pub textures: IndexMap<TextureHandle, TextureUsage>,
    pub buffers: IndexMap<BufferHandle, BufferUsage>,
}

impl ResourceUsage {
    fn texture(&mut self, handle: TextureHandle, usage: TextureUsage) {
        *self.textures.entry(handle).or_default() |= usage;
    }

    fn buffer(&mut self, handle: BufferHandle, usage: BufferUsage) {
        *self.buffers.entry(handle).or_default() |= usage;
    }
}

#[derive(Debug, Clone)]
pub struct CompiledProgram {
    pub units: Vec<CompiledUnit>,
    /// Indexed by [`LeafId`], in tree pre-order.
    pub leaves: Vec<CompiledLeaf>,
    pub resources: ResourceUsage,
    pub argument_buffers: Vec<ArgumentBufferLayout>,
}

impl CompiledProgram {
    pub fn leaf(&self, id: LeafId) -> Option<&CompiledLeaf> {
        self.leaves.get(id.0)
    }

    pub fn argument_buffer(&self, id: ArgumentBufferId) -> Option<&ArgumentBufferLayout> {
        self.argument_buffers.get(id.0)
    }

    /// Layout of each bind group of a leaf, resolving shared groups.
    pub fn group_layouts(&self, groups: &[GroupBinding]) -> Vec<Vec<LayoutEntry>> {
        groups
            .iter()
            .map(|group| match group {
                GroupBinding::Own(spec) => spec.layout(),
                GroupBinding::Shared(id) => self
                    .argument_buffer(*id)
                    .map(|layout| layout.group.layout())
                    .unwrap_or_default(),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Compile a component tree against a resource table.
pub fn compile<G: Gpu>(
    program: &Program<G>,
    table: &ResourceTable,
    options: &CompileOptions,
) -> Result<CompiledProgram, CompileError> {
    let flat = flatten(program);
    let mut compiler = Compiler {
        table,
        options,
        usage: ResourceUsage::default(),
        argument_buffers: IndexMap::new(),
        units: flat.units.iter().map(UnitState::new).collect(),
    };

    let mut leaves = Vec::with_capacity(flat.leaves.len());
    for leaf in &flat.leaves {
        let compiled = match leaf.node {
            LeafNode::Dispatch(dispatch) => {
                CompiledLeaf::Dispatch(compiler.dispatch(leaf.unit, dispatch)?)
            }
            LeafNode::Draw(draw) => CompiledLeaf::Draw(compiler.draw(leaf.unit, draw)?),
            LeafNode::Blit(blit) => {
                compiler.blit(blit)?;
                CompiledLeaf::Host
            }
            LeafNode::Filter(filter) => {
                compiler.filter(filter)?;
                CompiledLeaf::Host
            }
            LeafNode::Callback => CompiledLeaf::Host,
        };
        tracing::trace!("compiled leaf {}", leaf.path);
        leaves.push(compiled);
    }

    let units = compiler
        .units
        .into_iter()
        .map(UnitState::finish)
        .collect::<Result<Vec<_>, _>>()?;
    for unit in &units {
        tracing::debug!(
            "compiled unit '{}': {} entries, {} structs, {} bytes of WGSL",
            unit.label,
            unit.entries.len(),
            unit.structs.len(),
            unit.source.len()
        );
    }

    Ok(CompiledProgram {
        units,
        leaves,
        resources: compiler.usage,
        argument_buffers: compiler
            .argument_buffers
            .into_values()
            .map(|registered| registered.layout)
            .collect(),
    })
}

// ---------------------------------------------------------------------------
// Per-unit state
// ---------------------------------------------------------------------------

struct UnitState {
    label: String,
    library: String,
    symbols: SymbolTable,
    functions: String,
    entries: Vec<String>,
    taken: HashSet<String>,
}

impl UnitState {
    fn new(unit: &FlatUnit<'_>) -> Self {
        Self {
            label: unit.label.clone(),
            library: unit.library.to_string(),
            symbols: SymbolTable::new(),
            functions: String::new(),
            entries: Vec::new(),
            taken: HashSet::new(),
        }
    }

    /// Reserve an entry point name, suffixing `_<n>` on collision.
    fn unique_entry(&mut self, name: &str) -> String {
        let mut candidate = name.to_string();
        let mut n = 1;
        while self.taken.contains(&candidate) {
            candidate = format!("{name}_{n}");
            n += 1;
        }
        self.taken.insert(candidate.clone());
        self.entries.push(candidate.clone());
        candidate
    }

    fn finish(self) -> Result<CompiledUnit, CompileError> {
        let mut source = self.symbols.declarations()?;
        let library = self.library.trim();
        if !library.is_empty() {
            source.push_str(library);
            source.push_str("\n\n");
        }
        source.push_str(&self.functions);
        Ok(CompiledUnit {
            label: self.label,
            source,
            structs: self.symbols.iter().map(|s| s.name.clone()).collect(),
            entries: self.entries,
        })
    }
}

struct RegisteredBuffer {
    id: ArgumentBufferId,
    layout: ArgumentBufferLayout,
    members: Vec<Declared>,
}

/// A binding plus the WGSL needed to declare it.
#[derive(Clone)]
struct Declared {
    spec: BindingSpec,
    /// `var`, `var<uniform>`, `var<storage, read>` ...
    var: String,
    ty: String,
}

/// Bindings of one leaf before group numbers are known.
#[derive(Default)]
struct LeafBindings {
    /// Declarations per function, keyed by the entry they belong to.
    buffers: Vec<(String, Declared)>,
    textures: Vec<(String, Declared)>,
    shared: Vec<ArgumentBufferId>,
    shared_decls: Vec<(String, ArgumentBufferId, Declared)>,
    bytes: Vec<BytesSlot>,
}

impl LeafBindings {
    /// Assign dense group numbers and render each function's declarations.
    fn finish(self) -> (Vec<GroupBinding>, HashMap<String, String>, Vec<BytesSlot>) {
        let mut groups = Vec::new();
        let mut text: HashMap<String, String> = HashMap::new();
        let mut emit = |entry: &str, group: usize, declared: &Declared| {
            text.entry(entry.to_string()).or_default().push_str(&format!(
                "@group({group}) @binding({}) {} {}: {};\n",
                declared.spec.entry.binding, declared.var, declared.spec.name, declared.ty
            ));
        };

        for space in [self.buffers, self.textures] {
            if space.is_empty() {
                continue;
            }
            let group = groups.len();
            let mut spec = GroupSpec::default();
            for (entry, declared) in space {
                emit(&entry, group, &declared);
                spec.bindings.push(declared.spec);
            }
            spec.bindings.sort_by_key(|b| b.entry.binding);
            groups.push(GroupBinding::Own(spec));
        }
        let first_shared = groups.len();
        for id in &self.shared {
            groups.push(GroupBinding::Shared(*id));
        }
        for (entry, id, declared) in &self.shared_decls {
            let offset = self.shared.iter().position(|s| s == id).unwrap_or(0);
            emit(entry, first_shared + offset, declared);
        }
        (groups, text, self.bytes)
    }
}

/// Index assignment over the two per-function spaces.
struct IndexAllocator<'a> {
    owner: &'a str,
    buffers: BTreeSet<u32>,
    textures: BTreeSet<u32>,
}

impl<'a> IndexAllocator<'a> {
    fn new(owner: &'a str) -> Self {
        Self {
            owner,
            buffers: BTreeSet::new(),
            textures: BTreeSet::new(),
        }
    }

    fn used(&mut self, space: IndexSpace) -> &mut BTreeSet<u32> {
        match space {
            IndexSpace::Buffers => &mut self.buffers,
            IndexSpace::Textures => &mut self.textures,
        }
    }

    /// Claim every caller-pinned index up front.
    fn reserve<'b>(&mut self, arguments: impl IntoIterator<Item = &'b Argument>) -> Result<(), CompileError> {
        for argument in arguments {
            if let (Some(index), Some(space)) = (argument.index, argument.space()) {
                if !self.used(space).insert(index) {
                    return Err(CompileError::DuplicateIndex {
                        function: self.owner.to_string(),
                        space,
                        index,
                    });
                }
            }
        }
        Ok(())
    }

    fn assign(&mut self, argument: &Argument, space: IndexSpace) -> u32 {
        match argument.index {
            Some(index) => index,
            None => self.next_free(space),
        }
    }

    fn next_free(&mut self, space: IndexSpace) -> u32 {
        let used = self.used(space);
        let index = (0..).find(|i| !used.contains(i)).unwrap_or(0);
        used.insert(index);
        index
    }

    /// One past the highest index in use.
    fn trailing(&mut self, space: IndexSpace) -> u32 {
        let used = self.used(space);
        let index = used.last().map_or(0, |last| last + 1);
        used.insert(index);
        index
    }
}

fn check_names(function: &str, arguments: &[Argument]) -> Result<(), CompileError> {
    let mut seen = HashSet::new();
    for argument in arguments {
        let names: Vec<&str> = match &argument.kind {
            ArgumentKind::ArgumentBuffer { members, .. } => {
                members.iter().map(|m| m.name.as_str()).collect()
            }
            _ => vec![argument.name.as_str()],
        };
        for name in names {
            if !seen.insert(name) {
                return Err(CompileError::DuplicateName {
                    function: function.to_string(),
                    name: name.to_string(),
                });
            }
        }
    }
    Ok(())
}

fn global_name(entry: &str, name: &str) -> String {
    format!("{entry}__{name}")
}

// ---------------------------------------------------------------------------
// Compiler
// ---------------------------------------------------------------------------

struct Compiler<'a> {
    table: &'a ResourceTable,
    options: &'a CompileOptions,
    usage: ResourceUsage,
    argument_buffers: IndexMap<String, RegisteredBuffer>,
    units: Vec<UnitState>,
}

/// One entry point being compiled.
struct FunctionJob<'s> {
    role: FunctionRole,
    name: &'s str,
    text: &'s str,
    span: FunctionSpan,
    arguments: &'s [Argument],
}

impl<'s> FunctionJob<'s> {
    fn locate(
        source: &'s str,
        role: FunctionRole,
        name: &'s str,
        arguments: &'s [Argument],
    ) -> Result<Self, CompileError> {
        let span = patcher::find_function(source, role, name)
            .map_err(|e| CompileError::patch(name, e))?;
        let (text, span) = span.extract(source);
        check_names(name, arguments)?;
        Ok(Self {
            role,
            name,
            text,
            span,
            arguments,
        })
    }

    /// Parameters and body, the text identifier queries look at.
    fn code(&self) -> String {
        format!("{}\n{}", self.span.params(self.text), self.span.body(self.text))
    }

    /// Builtin parameters for reserved identifiers the function uses.
    fn builtins(&self, patch: &mut FunctionPatch, force: &[&str]) {
        let params = self.span.params(self.text);
        let code = self.code();
        for builtin in self.role.builtins() {
            let wanted = force.contains(&builtin.ident)
                || patcher::references_identifier(&code, builtin.ident);
            if !wanted || patcher::references_identifier(params, builtin.ident) {
                continue;
            }
            match patcher::declared_builtin(params, builtin.builtin) {
                Some(existing) => {
                    patch
                        .identifiers
                        .insert(builtin.ident.to_string(), existing);
                }
                None => patch.parameters.push(builtin.parameter()),
            }
        }
    }

    /// Name the bounds check uses for the global invocation id.
    fn gid_name(&self, patch: &FunctionPatch) -> String {
        patch
            .identifiers
            .get("gid")
            .cloned()
            .unwrap_or_else(|| "gid".to_string())
    }
}

impl<'a> Compiler<'a> {
    fn dispatch(&mut self, unit: UnitId, dispatch: &Dispatch) -> Result<CompiledDispatch, CompileError> {
        let job = FunctionJob::locate(
            &dispatch.source,
            FunctionRole::Compute,
            &dispatch.function,
            &dispatch.arguments,
        )?;
        let mut plan = grid::resolve(
            job.name,
            &dispatch.fits,
            dispatch.scale,
            &dispatch.arguments,
            self.table,
            self.options.caps,
        )?;

        let mut patch = FunctionPatch::default();
        match patcher::workgroup_size(job.text, &job.span) {
            Some(Some(sizes)) => plan.workgroup = sizes,
            Some(None) => {
                return Err(CompileError::WorkgroupSize {
                    function: job.name.to_string(),
                })
            }
            None => {
                let [x, y, z] = plan.workgroup;
                patch.attribute = Some(format!("@workgroup_size({x}, {y}, {z})"));
            }
        }

        let entry = self.units[unit.0].unique_entry(job.name);
        if entry != job.name {
            tracing::debug!("entry `{}` renamed to `{entry}`", job.name);
            patch.rename_to = Some(entry.clone());
        }

        let mut alloc = IndexAllocator::new(job.name);
        alloc.reserve(job.arguments)?;
        let mut bindings = LeafBindings::default();
        self.bind_arguments(unit, &job, &entry, StageMask::COMPUTE, &mut alloc, &mut bindings, &mut patch)?;

        let code = job.code();
        let grid_declared = patcher::references_identifier(job.span.params(job.text), GRID_SIZE);
        let wants_grid = plan.bounds_check || patcher::references_identifier(&code, GRID_SIZE);
        if wants_grid && !grid_declared {
            let name = global_name(&entry, GRID_SIZE);
            let binding = alloc.trailing(IndexSpace::Buffers);
            bindings.buffers.push((
                entry.clone(),
                Declared {
                    spec: BindingSpec {
                        name: name.clone(),
                        entry: LayoutEntry {
                            binding,
                            kind: BindingKind::Uniform,
                            visibility: StageMask::COMPUTE,
                        },
                        source: BindingSource::GridExtent,
                    },
                    var: "var<uniform>".to_string(),
                    ty: plan.dims.wgsl_type().to_string(),
                },
            ));
            patch.identifiers.insert(GRID_SIZE.to_string(), name);
        } else if grid_declared {
            plan.bounds_check = false;
        }

        let force: &[&str] = if plan.bounds_check { &["gid"] } else { &[] };
        job.builtins(&mut patch, force);
        if patcher::references_identifier(&code, THREADS_PER_GROUP) {
            let [x, y, z] = plan.workgroup;
            patch.prologue.push_str(&format!(
                "\n    let {THREADS_PER_GROUP} = vec3<u32>({x}u, {y}u, {z}u);"
            ));
        }
        if plan.bounds_check {
            let grid = global_name(&entry, GRID_SIZE);
            patch
                .prologue
                .push_str(&grid::bounds_check(plan.dims, &job.gid_name(&patch), &grid));
        }

        let (groups, declarations, bytes) = bindings.finish();
        let patched = patcher::apply(job.text, &job.span, &patch);
        self.emit(unit, &dispatch.label, &[(entry.as_str(), patched)], &declarations);

        Ok(CompiledDispatch {
            unit,
            entry,
            groups,
            bytes,
            grid: plan,
        })
    }

    fn draw(&mut self, unit: UnitId, draw: &Draw) -> Result<CompiledDraw, CompileError> {
        if draw.targets.is_empty() {
            return Err(CompileError::NoTargets {
                function: draw.label.clone(),
            });
        }
        let vertex = FunctionJob::locate(&draw.source, FunctionRole::Vertex, &draw.vertex, &draw.vertex_args)?;
        let fragment = FunctionJob::locate(
            &draw.source,
            FunctionRole::Fragment,
            &draw.fragment,
            &draw.fragment_args,
        )?;

        let mut alloc = IndexAllocator::new(&draw.label);
        alloc.reserve(draw.vertex_args.iter().chain(&draw.fragment_args))?;
        let mut bindings = LeafBindings::default();
        let mut patched = Vec::with_capacity(2);
        let mut entries = Vec::with_capacity(2);
        for (job, stage) in [(&vertex, StageMask::VERTEX), (&fragment, StageMask::FRAGMENT)] {
            let mut patch = FunctionPatch::default();
            let entry = self.units[unit.0].unique_entry(job.name);
            if entry != job.name {
                patch.rename_to = Some(entry.clone());
            }
            self.bind_arguments(unit, job, &entry, stage, &mut alloc, &mut bindings, &mut patch)?;
            job.builtins(&mut patch, &[]);
            patched.push((entry.clone(), patcher::apply(job.text, &job.span, &patch)));
            entries.push(entry);
        }

        if let Some(index) = draw.index {
            let decl = self.buffer_decl(&draw.label, index)?;
            let valid = decl.element.is_scalar(ScalarType::U16) || decl.element.is_scalar(ScalarType::U32);
            if !valid {
                return Err(CompileError::BadIndexType {
                    function: draw.label.clone(),
                });
            }
            self.usage.buffer(index, BufferUsage::INDEX);
        }
        if let VertexCount::Buffer(buffer) = draw.vertices {
            self.buffer_decl(&draw.label, buffer)?;
        }
        for target in &draw.targets {
            if let TextureRef::Resource(texture) = target.texture {
                self.texture_decl(&draw.label, texture)?;
                self.usage.texture(texture, TextureUsage::RENDER_TARGET);
            }
        }
        if let Some(depth) = draw.depth {
            self.texture_decl(&draw.label, depth.texture)?;
            self.usage.texture(depth.texture, TextureUsage::RENDER_TARGET);
        }

        let (groups, declarations, bytes) = bindings.finish();
        let functions: Vec<(&str, String)> = patched.iter().map(|(e, t)| (e.as_str(), t.clone())).collect();
        self.emit(unit, &draw.label, &functions, &declarations);

        let mut entries = entries.into_iter();
        Ok(CompiledDraw {
            unit,
            vertex_entry: entries.next().unwrap_or_default(),
            fragment_entry: entries.next().unwrap_or_default(),
            groups,
            bytes,
        })
    }

    fn blit(&mut self, blit: &Blit) -> Result<(), CompileError> {
        match blit.op {
            BlitOp::CopyTexture {
                source,
                destination,
            } => {
                self.texture_decl(&blit.label, source)?;
                self.usage.texture(source, TextureUsage::COPY_SRC);
                if let TextureRef::Resource(destination) = destination {
                    self.texture_decl(&blit.label, destination)?;
                    self.usage.texture(destination, TextureUsage::COPY_DST);
                }
            }
            BlitOp::CopyBuffer {
                source,
                destination,
            } => {
                self.buffer_decl(&blit.label, source)?;
                self.buffer_decl(&blit.label, destination)?;
                self.usage.buffer(source, BufferUsage::COPY_SRC);
                self.usage.buffer(destination, BufferUsage::COPY_DST);
            }
            BlitOp::ClearBuffer(buffer) => {
                self.buffer_decl(&blit.label, buffer)?;
                self.usage.buffer(buffer, BufferUsage::COPY_DST);
            }
        }
        Ok(())
    }

    fn filter(&mut self, filter: &VendorFilter) -> Result<(), CompileError> {
        self.texture_decl(&filter.label, filter.source)?;
        let destination = self.texture_decl(&filter.label, filter.destination)?;
        let storage = match destination.format {
            FormatPolicy::Fixed(format) => format.storage_name().is_some(),
            FormatPolicy::Surface => false,
        };
        if !storage {
            return Err(CompileError::NotStorageFormat {
                function: filter.label.clone(),
                texture: destination.name.clone(),
                format: format!("{:?}", destination.format),
            });
        }
        self.usage.texture(filter.source, TextureUsage::SAMPLED);
        self.usage.texture(filter.destination, TextureUsage::STORAGE);
        Ok(())
    }

    // -- arguments ----------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn bind_arguments(
        &mut self,
        unit: UnitId,
        job: &FunctionJob<'_>,
        entry: &str,
        stage: StageMask,
        alloc: &mut IndexAllocator<'_>,
        bindings: &mut LeafBindings,
        patch: &mut FunctionPatch,
    ) -> Result<(), CompileError> {
        for argument in job.arguments {
            if let ArgumentKind::ArgumentBuffer { name, members } = &argument.kind {
                let (id, declared) = self.argument_buffer(unit, job.name, name, members, stage)?;
                if !bindings.shared.contains(&id) {
                    bindings.shared.push(id);
                }
                for mut member in declared {
                    let local = member.spec.name.clone();
                    let global = global_name(entry, &local);
                    member.spec.name = global.clone();
                    patch.identifiers.insert(local, global);
                    bindings.shared_decls.push((entry.to_string(), id, member));
                }
                continue;
            }

            let space = argument.space().unwrap_or(IndexSpace::Buffers);
            let binding = alloc.assign(argument, space);
            let mut declared = self.declare(unit, job.name, argument, binding, stage, &mut bindings.bytes)?;
            let global = global_name(entry, &argument.name);
            declared.spec.name = global.clone();
            patch.identifiers.insert(argument.name.clone(), global);
            match space {
                IndexSpace::Buffers => bindings.buffers.push((entry.to_string(), declared)),
                IndexSpace::Textures => bindings.textures.push((entry.to_string(), declared)),
            }
        }
        Ok(())
    }

    /// Binding and WGSL declaration of a plain argument.
    fn declare(
        &mut self,
        unit: UnitId,
        function: &str,
        argument: &Argument,
        binding: u32,
        stage: StageMask,
        bytes: &mut Vec<BytesSlot>,
    ) -> Result<Declared, CompileError> {
        let (kind, source, var, ty) = match &argument.kind {
            ArgumentKind::Buffer { buffer, space } => {
                let decl = self.buffer_decl(function, *buffer)?;
                let element = match &argument.gpu_type {
                    Some(_) => None,
                    None => Some(self.type_name(unit, &decl.element)?),
                };
                let (kind, var, ty, usage) = match space {
                    BufferSpace::Uniform => (
                        BindingKind::Uniform,
                        "var<uniform>",
                        element.unwrap_or_default(),
                        BufferUsage::UNIFORM,
                    ),
                    BufferSpace::Storage { read_only } => (
                        BindingKind::Storage {
                            read_only: *read_only,
                        },
                        if *read_only {
                            "var<storage, read>"
                        } else {
                            "var<storage, read_write>"
                        },
                        element.map(|e| format!("array<{e}>")).unwrap_or_default(),
                        BufferUsage::STORAGE,
                    ),
                };
                self.usage.buffer(*buffer, usage);
                (kind, BindingSource::Buffer(*buffer), var, ty)
            }
            ArgumentKind::Bytes(value) => {
                let gpu_type = value.gpu_type();
                let ty = match &argument.gpu_type {
                    Some(_) => String::new(),
                    None => self.type_name(unit, &gpu_type)?,
                };
                let native = value.bytes().len();
                let gpu = gpu_type.wgsl_layout().map_or(0, |(_, size)| size);
                let size = (native.max(gpu).max(16) as u64).div_ceil(16) * 16;
                bytes.push(BytesSlot {
                    name: argument.name.clone(),
                    size,
                    source: Arc::clone(value),
                });
                (
                    BindingKind::Uniform,
                    BindingSource::Bytes(bytes.len() - 1),
                    "var<uniform>",
                    ty,
                )
            }
            ArgumentKind::Texture { texture, access } => {
                let (kind, ty, usage) = self.texture_binding(function, *texture, *access)?;
                self.usage.texture(*texture, usage);
                (kind, BindingSource::Texture(*texture), "var", ty)
            }
            ArgumentKind::ArgumentBuffer { name, .. } => {
                return Err(CompileError::BadArgumentBufferMember {
                    name: function.to_string(),
                    member: name.clone(),
                })
            }
        };
        Ok(Declared {
            spec: BindingSpec {
                name: argument.name.clone(),
                entry: LayoutEntry {
                    binding,
                    kind,
                    visibility: stage,
                },
                source,
            },
            var: var.to_string(),
            ty: argument.gpu_type.clone().unwrap_or(ty),
        })
    }

    fn texture_binding(
        &self,
        function: &str,
        texture: TextureHandle,
        access: TextureAccess,
    ) -> Result<(BindingKind, String, TextureUsage), CompileError> {
        let decl = self.texture_decl(function, texture)?;
        let dimension = decl.dimension;
        let suffix = dimension.wgsl_suffix();
        if access == TextureAccess::Sample {
            let sample = match decl.format {
                FormatPolicy::Fixed(format) => format.sample_kind(),
                FormatPolicy::Surface => SampleKind::Float,
            };
            let ty = match sample {
                SampleKind::Float => format!("texture_{suffix}<f32>"),
                SampleKind::Uint => format!("texture_{suffix}<u32>"),
                SampleKind::Sint => format!("texture_{suffix}<i32>"),
                SampleKind::Depth => format!("texture_depth_{suffix}"),
            };
            return Ok((
                BindingKind::Texture { dimension, sample },
                ty,
                TextureUsage::SAMPLED,
            ));
        }

        if dimension == TextureDimension::Cube {
            return Err(CompileError::CubeStorage {
                function: function.to_string(),
                texture: decl.name.clone(),
            });
        }
        let format = match decl.format {
            FormatPolicy::Fixed(format) if format.storage_name().is_some() => format,
            other => {
                return Err(CompileError::NotStorageFormat {
                    function: function.to_string(),
                    texture: decl.name.clone(),
                    format: format!("{other:?}"),
                })
            }
        };
        let read_write = access == TextureAccess::ReadWrite;
        let mode = if read_write { "read_write" } else { "write" };
        let ty = format!(
            "texture_storage_{suffix}<{}, {mode}>",
            format.storage_name().unwrap_or_default()
        );
        Ok((
            BindingKind::StorageTexture {
                dimension,
                format,
                read_write,
            },
            ty,
            TextureUsage::STORAGE,
        ))
    }

    /// Register or reuse a named argument buffer. Later references must
    /// repeat the first definition exactly; they then share its group.
    fn argument_buffer(
        &mut self,
        unit: UnitId,
        function: &str,
        name: &str,
        members: &[Argument],
        stage: StageMask,
    ) -> Result<(ArgumentBufferId, Vec<Declared>), CompileError> {
        let mut alloc = IndexAllocator::new(name);
        alloc.reserve(members)?;
        let mut scratch = Vec::new();
        let mut declared = Vec::with_capacity(members.len());
        for member in members {
            if matches!(
                member.kind,
                ArgumentKind::Bytes(_) | ArgumentKind::ArgumentBuffer { .. }
            ) {
                return Err(CompileError::BadArgumentBufferMember {
                    name: name.to_string(),
                    member: member.name.clone(),
                });
            }
            // Members share one binding space inside the buffer's group.
            let binding = alloc.assign(member, IndexSpace::Buffers);
            declared.push(self.declare(unit, name, member, binding, stage, &mut scratch)?);
        }

        if let Some(registered) = self.argument_buffers.get_mut(name) {
            let same = registered.members.len() == declared.len()
                && registered.members.iter().zip(&declared).all(|(a, b)| {
                    a.spec.name == b.spec.name
                        && a.spec.source == b.spec.source
                        && a.spec.entry.binding == b.spec.entry.binding
                        && a.var == b.var
                        && a.ty == b.ty
                });
            if !same {
                return Err(CompileError::ArgumentBufferRedefined {
                    function: function.to_string(),
                    name: name.to_string(),
                });
            }
            for member in registered.members.iter_mut() {
                member.spec.entry.visibility |= stage;
            }
            for binding in registered.layout.group.bindings.iter_mut() {
                binding.entry.visibility |= stage;
            }
            return Ok((registered.id, registered.members.clone()));
        }

        let id = ArgumentBufferId(self.argument_buffers.len());
        let mut group = GroupSpec {
            bindings: declared.iter().map(|d| d.spec.clone()).collect(),
        };
        group.bindings.sort_by_key(|b| b.entry.binding);
        tracing::debug!("registered argument buffer '{name}' with {} members", declared.len());
        self.argument_buffers.insert(
            name.to_string(),
            RegisteredBuffer {
                id,
                layout: ArgumentBufferLayout {
                    name: name.to_string(),
                    group,
                },
                members: declared.clone(),
            },
        );
        Ok((id, declared))
    }

    // -- helpers ------------------------------------------------------------

    fn type_name(&mut self, unit: UnitId, ty: &GpuType) -> Result<String, CompileError> {
        self.units[unit.0].symbols.declare(ty)?;
        Ok(ty.wgsl_name()?)
    }

    fn texture_decl(&self, function: &str, texture: TextureHandle) -> Result<&'a kiln_core::TextureDecl, CompileError> {
        self.table
            .texture(texture)
            .ok_or_else(|| CompileError::UnknownTexture {
                function: function.to_string(),
                handle: texture,
            })
    }

    fn buffer_decl(&self, function: &str, buffer: BufferHandle) -> Result<&'a kiln_core::BufferDecl, CompileError> {
        self.table
            .buffer_decl(buffer)
            .ok_or_else(|| CompileError::UnknownBuffer {
                function: function.to_string(),
                handle: buffer,
            })
    }

    fn emit(
        &mut self,
        unit: UnitId,
        label: &str,
        functions: &[(&str, String)],
        declarations: &HashMap<String, String>,
    ) {
        let out = &mut self.units[unit.0].functions;
        out.push_str(&format!("// {label}\n"));
        for (entry, text) in functions {
            if let Some(decls) = declarations.get(*entry) {
                out.push_str(decls);
            }
            out.push_str(text);
            out.push_str("\n\n");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{Group, LoadAction};
    use crate::recording::RecordingGpu;
    use crate::validation::validate_unit;
    use kiln_core::grid::GridError;
    use kiln_core::layout::LayoutError;
    use kiln_core::{Extent, PixelFormat, ResourceSize, TextureDecl, Uniform};

    type P = Program<RecordingGpu>;

    #[repr(C)]
    #[derive(Clone, Copy)]
    struct Particle {
        position: [f32; 2],
        velocity: [f32; 2],
    }
    kiln_core::gpu_struct!(Particle { position, velocity });

    mod imposter {
        #[repr(C)]
        #[derive(Clone, Copy)]
        pub struct Particle {
            pub mass: f32,
        }
        kiln_core::gpu_struct!(Particle { mass });
    }

    fn caps(non_uniform: bool) -> CompileOptions {
        CompileOptions {
            caps: DeviceCaps {
                non_uniform_dispatch: non_uniform,
            },
        }
    }

    fn dispatch_leaf(program: &CompiledProgram, leaf: usize) -> &CompiledDispatch {
        match program.leaf(LeafId(leaf)) {
            Some(CompiledLeaf::Dispatch(dispatch)) => dispatch,
            other => panic!("leaf {leaf} is not a dispatch: {other:?}"),
        }
    }

    fn own_bindings(groups: &[GroupBinding], group: usize) -> Vec<(String, u32)> {
        match &groups[group] {
            GroupBinding::Own(spec) => spec
                .bindings
                .iter()
                .map(|b| (b.name.clone(), b.entry.binding))
                .collect(),
            GroupBinding::Shared(id) => panic!("group {group} is shared argument buffer {id:?}"),
        }
    }

    #[test]
    fn test_kernel_source_is_patched_and_valid() {
        let mut table = ResourceTable::new();
        let particles = table.buffer::<Particle>("particles", 1000);
        let dt = Uniform::new(0.016f32);
        let program = P::new("").with(
            Dispatch::new(
                "integrate",
                "@compute\nfn integrate() {\n    let p = particles[gid.x];\n    particles[gid.x].position = p.position + p.velocity * dt;\n}\n",
            )
            .arg(Argument::buffer("particles", particles))
            .arg(Argument::bytes("dt", &dt))
            .fit_buffer("particles"),
        );
        let compiled = compile(&program, &table, &caps(false)).unwrap();
        let source = &compiled.units[0].source;

        assert!(source.starts_with("struct Particle {"));
        assert!(source.contains(
            "@group(0) @binding(0) var<storage, read_write> integrate__particles: array<Particle>;"
        ));
        assert!(source.contains("@group(0) @binding(1) var<uniform> integrate__dt: f32;"));
        assert!(source.contains("@group(0) @binding(2) var<uniform> integrate__grid_size: u32;"));
        assert!(source.contains("@compute @workgroup_size(64, 1, 1)"));
        assert!(source.contains("fn integrate(@builtin(global_invocation_id) gid: vec3<u32>)"));
        assert!(source.contains("if (gid.x >= integrate__grid_size) { return; }"));
        validate_unit("main", source).unwrap();

        let leaf = dispatch_leaf(&compiled, 0);
        assert_eq!(leaf.bytes.len(), 1);
        assert_eq!(leaf.bytes[0].size, 16);
        assert_eq!(leaf.grid.workgroup, [64, 1, 1]);
    }

    #[test]
    fn test_unpinned_arguments_fill_free_indices() {
        let mut table = ResourceTable::new();
        let a = table.buffer::<f32>("a", 8);
        let b = table.buffer::<f32>("b", 8);
        let c = table.buffer::<f32>("c", 8);
        let image = table.add_texture(TextureDecl::new(
            "image",
            ResourceSize::Fixed(8, 8),
            PixelFormat::Rgba8Unorm,
        ));
        let program = P::new("").with(
            Dispatch::new("k", "@compute fn k() { a[0] = b[0] + c[0]; }")
                .arg(Argument::buffer("a", a))
                .arg(Argument::read_buffer("b", b).at_index(0))
                .arg(Argument::read_buffer("c", c))
                .arg(Argument::texture("image", image).at_index(3))
                .fit_fixed(8u32),
        );
        let compiled = compile(&program, &table, &caps(false)).unwrap();
        let leaf = dispatch_leaf(&compiled, 0);

        assert_eq!(leaf.groups.len(), 2);
        assert_eq!(
            own_bindings(&leaf.groups, 0),
            vec![
                ("k__b".to_string(), 0),
                ("k__a".to_string(), 1),
                ("k__c".to_string(), 2),
                ("k__grid_size".to_string(), 3),
            ]
        );
        assert_eq!(own_bindings(&leaf.groups, 1), vec![("k__image".to_string(), 3)]);
        assert!(compiled.units[0]
            .source
            .contains("@group(1) @binding(3) var k__image: texture_2d<f32>;"));
    }

    #[test]
    fn test_duplicate_pinned_index_rejected() {
        let mut table = ResourceTable::new();
        let a = table.buffer::<f32>("a", 8);
        let b = table.buffer::<f32>("b", 8);
        let program = P::new("").with(
            Dispatch::new("k", "@compute fn k() { a[0] = b[0]; }")
                .arg(Argument::buffer("a", a).at_index(1))
                .arg(Argument::buffer("b", b).at_index(1))
                .fit_fixed(8u32),
        );
        assert_eq!(
            compile(&program, &table, &caps(false)).unwrap_err(),
            CompileError::DuplicateIndex {
                function: "k".into(),
                space: IndexSpace::Buffers,
                index: 1,
            }
        );
    }

    #[test]
    fn test_duplicate_argument_name_rejected() {
        let mut table = ResourceTable::new();
        let a = table.buffer::<f32>("a", 8);
        let program = P::new("").with(
            Dispatch::new("k", "@compute fn k() { a[0] = 1.0; }")
                .arg(Argument::buffer("a", a))
                .arg(Argument::read_buffer("a", a))
                .fit_fixed(8u32),
        );
        assert_eq!(
            compile(&program, &table, &caps(false)).unwrap_err(),
            CompileError::DuplicateName {
                function: "k".into(),
                name: "a".into(),
            }
        );
    }

    #[test]
    fn test_structs_declared_once_per_unit() {
        let mut table = ResourceTable::new();
        let current = table.buffer::<Particle>("current", 64);
        let next = table.buffer::<Particle>("next", 64);
        let program = P::new("")
            .with(
                Dispatch::new("advance", "@compute fn advance() { next[gid.x] = current[gid.x]; }")
                    .arg(Argument::read_buffer("current", current))
                    .arg(Argument::buffer("next", next))
                    .fit_buffer("next"),
            )
            .with(
                Dispatch::new("settle", "@compute fn settle() { current[gid.x] = next[gid.x]; }")
                    .arg(Argument::buffer("current", current))
                    .arg(Argument::read_buffer("next", next))
                    .fit_buffer("current"),
            );
        let compiled = compile(&program, &table, &caps(false)).unwrap();
        let unit = &compiled.units[0];
        assert_eq!(unit.structs, vec!["Particle".to_string()]);
        assert_eq!(unit.source.matches("struct Particle {").count(), 1);
        validate_unit("main", &unit.source).unwrap();
    }

    #[test]
    fn test_conflicting_struct_names_rejected() {
        let mut table = ResourceTable::new();
        let real = table.buffer::<Particle>("real", 4);
        let fake = table.buffer::<imposter::Particle>("fake", 4);
        let program = P::new("").with(
            Dispatch::new("k", "@compute fn k() { real[0].position.x = fake[0].mass; }")
                .arg(Argument::buffer("real", real))
                .arg(Argument::read_buffer("fake", fake))
                .fit_fixed(4u32),
        );
        assert_eq!(
            compile(&program, &table, &caps(false)).unwrap_err(),
            CompileError::Layout(LayoutError::Conflict {
                name: "Particle".into()
            })
        );
    }

    #[test]
    fn test_only_referenced_builtins_are_added() {
        let mut table = ResourceTable::new();
        let out = table.buffer::<u32>("out", 64);
        let program = P::new("").with(
            Dispatch::new("k", "@compute fn k() { out[lid.x] = group_id.x; }")
                .arg(Argument::buffer("out", out))
                .fit_fixed(64u32),
        );
        let compiled = compile(&program, &table, &caps(true)).unwrap();
        let source = &compiled.units[0].source;
        assert!(source.contains("@builtin(local_invocation_id) lid: vec3<u32>"));
        assert!(source.contains("@builtin(workgroup_id) group_id: vec3<u32>"));
        assert!(!source.contains("global_invocation_id"));
        assert!(!source.contains("num_workgroups"));
    }

    #[test]
    fn test_bounds_check_follows_device_caps() {
        let mut table = ResourceTable::new();
        let image = table.add_texture(TextureDecl::new(
            "image",
            ResourceSize::Viewport,
            PixelFormat::Rgba8Unorm,
        ));
        let program = P::new("").with(
            Dispatch::new(
                "fill",
                "@compute fn fill() { textureStore(image, gid.xy, vec4<f32>(1.0)); }",
            )
            .arg(Argument::write_texture("image", image))
            .fit_texture("image"),
        );

        let uniform = compile(&program, &table, &caps(false)).unwrap();
        let source = &uniform.units[0].source;
        assert!(source.contains("var<uniform> fill__grid_size: vec2<u32>;"));
        assert!(source.contains(
            "if (gid.x >= fill__grid_size.x || gid.y >= fill__grid_size.y) { return; }"
        ));
        assert!(source.contains("@workgroup_size(8, 8, 1)"));
        validate_unit("main", source).unwrap();
        let plan = &dispatch_leaf(&uniform, 0).grid;
        assert!(plan.bounds_check && !plan.exact_threads);

        let exact = compile(&program, &table, &caps(true)).unwrap();
        let source = &exact.units[0].source;
        assert!(!source.contains("grid_size"));
        assert!(!source.contains("return;"));
        validate_unit("main", source).unwrap();
        let plan = &dispatch_leaf(&exact, 0).grid;
        assert!(!plan.bounds_check && plan.exact_threads);
    }

    #[test]
    fn test_existing_builtin_parameter_is_reused() {
        let mut table = ResourceTable::new();
        let out = table.buffer::<u32>("out", 100);
        let program = P::new("").with(
            Dispatch::new(
                "k",
                "@compute @workgroup_size(32)\nfn k(@builtin(global_invocation_id) id: vec3<u32>) { out[id.x] = id.x; }",
            )
            .arg(Argument::buffer("out", out))
            .fit_buffer("out"),
        );
        let compiled = compile(&program, &table, &caps(false)).unwrap();
        let source = &compiled.units[0].source;
        assert_eq!(source.matches("global_invocation_id").count(), 1);
        assert!(source.contains("if (id.x >= k__grid_size) { return; }"));
        assert_eq!(source.matches("@workgroup_size").count(), 1);
        assert_eq!(dispatch_leaf(&compiled, 0).grid.workgroup, [32, 1, 1]);
        validate_unit("main", source).unwrap();
    }

    #[test]
    fn test_duplicate_entry_points_are_renamed() {
        let mut table = ResourceTable::new();
        let data = table.buffer::<f32>("data", 16);
        let kernel = || {
            Dispatch::new("step", "@compute fn step() { data[gid.x] = data[gid.x] * 0.5; }")
                .arg(Argument::buffer("data", data))
                .fit_buffer("data")
        };
        let program = P::new("").with(kernel()).with(kernel());
        let compiled = compile(&program, &table, &caps(false)).unwrap();
        let unit = &compiled.units[0];
        assert_eq!(unit.entries, vec!["step".to_string(), "step_1".to_string()]);
        assert_eq!(dispatch_leaf(&compiled, 1).entry, "step_1");
        assert!(unit.source.contains("fn step_1("));
        assert!(unit.source.contains("step_1__data[gid.x] = step_1__data[gid.x] * 0.5;"));
        validate_unit("main", &unit.source).unwrap();
    }

    #[test]
    fn test_isolated_group_compiles_into_its_own_unit() {
        let mut table = ResourceTable::new();
        let data = table.buffer::<f32>("data", 16);
        let kernel = |name: &str| {
            Dispatch::new(name, format!("@compute fn {name}() {{ data[gid.x] = twice(data[gid.x]); }}"))
                .arg(Argument::buffer("data", data))
                .fit_buffer("data")
        };
        let program = P::new("fn twice(x: f32) -> f32 { return x * 2.0; }")
            .with(kernel("outer"))
            .with(
                Group::new("isolated")
                    .isolated("fn twice(x: f32) -> f32 { return x + x; }")
                    .child(kernel("inner")),
            );
        let compiled = compile(&program, &table, &caps(false)).unwrap();
        assert_eq!(compiled.units.len(), 2);
        assert_eq!(compiled.units[1].label, "isolated");
        assert_eq!(dispatch_leaf(&compiled, 0).unit, UnitId(0));
        assert_eq!(dispatch_leaf(&compiled, 1).unit, UnitId(1));
        assert!(compiled.units[0].source.contains("return x * 2.0;"));
        assert!(compiled.units[1].source.contains("return x + x;"));
        assert!(!compiled.units[1].source.contains("fn outer("));
        for unit in &compiled.units {
            validate_unit(&unit.label, &unit.source).unwrap();
        }
    }

    #[test]
    fn test_grid_fit_must_be_set_exactly_once() {
        let mut table = ResourceTable::new();
        let data = table.buffer::<f32>("data", 16);
        let base = || {
            Dispatch::new("k", "@compute fn k() { data[gid.x] = 0.0; }").arg(Argument::buffer("data", data))
        };

        let missing = P::new("").with(base());
        assert_eq!(
            compile(&missing, &table, &caps(false)).unwrap_err(),
            CompileError::Grid(GridError::Missing {
                function: "k".into()
            })
        );

        let twice = P::new("").with(base().fit_buffer("data").fit_fixed(Extent::flat(4, 4)));
        assert_eq!(
            compile(&twice, &table, &caps(false)).unwrap_err(),
            CompileError::Grid(GridError::Duplicate {
                function: "k".into()
            })
        );
    }

    #[test]
    fn test_index_buffer_element_type_checked() {
        let mut table = ResourceTable::new();
        let wide = table.buffer::<f32>("wide", 6);
        let narrow = table.buffer::<u16>("narrow", 6);
        let source = "@vertex fn vs() -> @builtin(position) vec4<f32> { return vec4<f32>(f32(vertex_id)); }\n\
                      @fragment fn fs() -> @location(0) vec4<f32> { return vec4<f32>(1.0); }";
        let draw = |index| {
            Draw::new("vs", "fs", source)
                .target(TextureRef::Surface, LoadAction::Load)
                .indexed(index)
        };

        let bad = P::new("").with(draw(wide));
        assert_eq!(
            compile(&bad, &table, &caps(false)).unwrap_err(),
            CompileError::BadIndexType {
                function: "vs".into()
            }
        );

        let good = P::new("").with(draw(narrow));
        let compiled = compile(&good, &table, &caps(false)).unwrap();
        assert!(compiled.units[0]
            .source
            .contains("@builtin(vertex_index) vertex_id: u32"));
        assert_eq!(compiled.resources.buffers.get(&narrow), Some(&BufferUsage::INDEX));
    }

    #[test]
    fn test_draw_needs_a_target() {
        let source = "@vertex fn vs() -> @builtin(position) vec4<f32> { return vec4<f32>(0.0); }\n\
                      @fragment fn fs() -> @location(0) vec4<f32> { return vec4<f32>(1.0); }";
        let program = P::new("").with(Draw::new("vs", "fs", source).label("empty"));
        assert_eq!(
            compile(&program, &ResourceTable::new(), &caps(false)).unwrap_err(),
            CompileError::NoTargets {
                function: "empty".into()
            }
        );
    }

    #[test]
    fn test_argument_buffer_shared_between_leaves() {
        let mut table = ResourceTable::new();
        let lights = table.buffer::<f32>("lights", 16);
        let a_out = table.buffer::<f32>("a_out", 16);
        let b_out = table.buffer::<f32>("b_out", 16);
        let scene = || Argument::argument_buffer("scene", vec![Argument::read_buffer("lights", lights)]);
        let program = P::new("")
            .with(
                Dispatch::new("a", "@compute fn a() { out[gid.x] = lights[gid.x]; }")
                    .arg(Argument::buffer("out", a_out))
                    .arg(scene())
                    .fit_buffer("out"),
            )
            .with(
                Dispatch::new("b", "@compute fn b() { out[gid.x] = lights[0]; }")
                    .arg(scene())
                    .arg(Argument::buffer("out", b_out))
                    .fit_buffer("out"),
            );
        let compiled = compile(&program, &table, &caps(false)).unwrap();

        assert_eq!(compiled.argument_buffers.len(), 1);
        assert_eq!(compiled.argument_buffers[0].name, "scene");
        for leaf in 0..2 {
            let groups = &dispatch_leaf(&compiled, leaf).groups;
            assert_eq!(groups.len(), 2);
            assert_eq!(groups[1], GroupBinding::Shared(ArgumentBufferId(0)));
        }
        let source = &compiled.units[0].source;
        assert!(source.contains("@group(1) @binding(0) var<storage, read> a__lights: array<f32>;"));
        assert!(source.contains("@group(1) @binding(0) var<storage, read> b__lights: array<f32>;"));
        validate_unit("main", source).unwrap();
    }

    #[test]
    fn test_argument_buffer_rejects_bytes_members() {
        let mut table = ResourceTable::new();
        let out = table.buffer::<f32>("out", 4);
        let program = P::new("").with(
            Dispatch::new("k", "@compute fn k() { out[0] = 1.0; }")
                .arg(Argument::buffer("out", out))
                .arg(Argument::argument_buffer(
                    "params",
                    vec![Argument::constant("scale", 1.0f32)],
                ))
                .fit_fixed(1u32),
        );
        assert_eq!(
            compile(&program, &table, &caps(false)).unwrap_err(),
            CompileError::BadArgumentBufferMember {
                name: "params".into(),
                member: "scale".into(),
            }
        );
    }

    #[test]
    fn test_argument_buffer_shared_across_units_declares_member_types() {
        let mut table = ResourceTable::new();
        let particles = table.buffer::<Particle>("particles", 16);
        let out = table.buffer::<f32>("out", 16);
        let kernel = |name: &str| {
            Dispatch::new(
                name,
                format!("@compute fn {name}() {{ out[gid.x] = particles[gid.x].position.x; }}"),
            )
            .arg(Argument::buffer("out", out))
            .arg(Argument::argument_buffer(
                "scene",
                vec![Argument::read_buffer("particles", particles)],
            ))
            .fit_buffer("out")
        };
        let program = P::new("")
            .with(kernel("outer"))
            .with(Group::new("isolated").isolated("").child(kernel("inner")));
        let compiled = compile(&program, &table, &caps(false)).unwrap();

        assert_eq!(compiled.argument_buffers.len(), 1);
        for unit in &compiled.units {
            assert!(unit.source.contains("struct Particle"));
            validate_unit(&unit.label, &unit.source).unwrap();
        }
    }

    #[test]
    fn test_argument_buffer_redefinition_must_match() {
        let mut table = ResourceTable::new();
        let particles = table.buffer::<Particle>("particles", 16);
        let masses = table.buffer::<imposter::Particle>("masses", 16);
        let out = table.buffer::<f32>("out", 16);
        let program = P::new("")
            .with(
                Dispatch::new("outer", "@compute fn outer() { out[gid.x] = lights[gid.x].position.x; }")
                    .arg(Argument::buffer("out", out))
                    .arg(Argument::argument_buffer(
                        "scene",
                        vec![Argument::read_buffer("lights", particles)],
                    ))
                    .fit_buffer("out"),
            )
            .with(
                Group::new("isolated").isolated("").child(
                    Dispatch::new("inner", "@compute fn inner() { out[gid.x] = masses[gid.x].mass; }")
                        .arg(Argument::buffer("out", out))
                        .arg(Argument::argument_buffer(
                            "scene",
                            vec![Argument::read_buffer("masses", masses)],
                        ))
                        .fit_buffer("out"),
                ),
            );
        assert_eq!(
            compile(&program, &table, &caps(false)).unwrap_err(),
            CompileError::ArgumentBufferRedefined {
                function: "inner".into(),
                name: "scene".into(),
            }
        );
    }

    #[test]
    fn test_resources_deduplicated_with_merged_usage() {
        let mut table = ResourceTable::new();
        let data = table.buffer::<f32>("data", 16);
        let copy = table.buffer::<f32>("copy", 16);
        let unused = table.buffer::<f32>("unused", 16);
        let program = P::new("")
            .with(
                Dispatch::new("k", "@compute fn k() { data[gid.x] = 1.0; }")
                    .arg(Argument::buffer("data", data))
                    .fit_buffer("data"),
            )
            .with(Blit::copy_buffer(data, copy));
        let compiled = compile(&program, &table, &caps(false)).unwrap();

        let buffers = &compiled.resources.buffers;
        assert_eq!(buffers.len(), 2);
        assert_eq!(
            buffers.get(&data),
            Some(&(BufferUsage::STORAGE | BufferUsage::COPY_SRC))
        );
        assert_eq!(buffers.get(&copy), Some(&BufferUsage::COPY_DST));
        assert!(!buffers.contains_key(&unused));
        assert!(matches!(compiled.leaf(LeafId(1)), Some(CompiledLeaf::Host)));
    }

    #[test]
    fn test_surface_format_texture_is_not_writable() {
        let mut table = ResourceTable::new();
        let color = table.add_texture(TextureDecl::surface_like("color"));
        let program = P::new("").with(
            Dispatch::new("k", "@compute fn k() { textureStore(color, gid.xy, vec4<f32>(0.0)); }")
                .arg(Argument::write_texture("color", color))
                .fit_texture("color"),
        );
        assert!(matches!(
            compile(&program, &table, &caps(false)),
            Err(CompileError::NotStorageFormat { texture, .. }) if texture == "color"
        ));
    }
}
