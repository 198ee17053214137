//! In-memory target process for integration tests
//!
//! `SimulatedTarget` implements `ProcessAccess` and `ThreadControl` over a
//! map of allocations, a fixed thread list and a module list. Remote threads
//! are "run" by decoding the call stub written into the target and
//! dispatching on the called address: calls into the fake agent image act
//! like the real agent (open the channel, program registers, uninit).
//!
//! `SimulatedTarget::access` plays one memory access through the guard page
//! and debug register logic the way the OS and the agent's exception handler
//! would.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tripwire_core::channel::{AgentChannel, HeapRegion, MappedRegion, RegionFactory};
use tripwire_core::debug_registers::{BreakCondition, BreakSize, DebugContext, Dr7, SlotIndex, TRAP_FLAG};
use tripwire_core::remote::CallEncoder;
use tripwire_core::target::{ProcessAccess, RemoteThread, ThreadControl, ThreadExit, ThreadHandle};
use tripwire_core::types::{Address, Bitness, ModuleInfo, ProcessId, Protection, RegionInfo, ThreadId};
use tripwire_core::{Result, SessionConfig, TripwireError};

pub const PAGE_SIZE: u64 = 0x1000;
pub const GAME_BASE: u64 = 0x0040_0000;
pub const GAME_SIZE: u64 = 0x10000;
pub const AGENT_BASE: u64 = 0x1000_0000;
pub const AGENT_IMAGE_SIZE: usize = 0x3000;
pub const EXPORT_DIRECTORY_RVA: u32 = 0x1000;
pub const EXPORT_CODE_RVA: u32 = 0x2000;
pub const AGENT_EXPORTS: [&str; 5] = ["init", "uninit", "installBreakpoint", "clearBreakpoint", "refresh"];
pub const THREADS: [u32; 3] = [100, 101, 102];

/// Something the simulated target was asked to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op
{
    Suspend(ThreadId),
    Resume
    {
        thread: ThreadId,
        /// Channel magic as seen by the agent at that moment
        channel_valid: Option<bool>,
    },
    Protect
    {
        address: Address,
        protection: Protection,
    },
    RemoteCall(String),
    Free(Address),
}

/// Failure and misbehaviour switches
#[derive(Debug, Default)]
pub struct Knobs
{
    pub fail_init: bool,
    pub omit_exports: Vec<&'static str>,
    pub hang_export: Option<&'static str>,
    pub install_returns_zero: bool,
    pub unsuspendable: HashSet<ThreadId>,
    pub fail_module_enumeration: bool,
}

/// Named regions shared between the controller and the simulated agent
#[derive(Clone, Default)]
pub struct SimRegionFactory
{
    regions: Arc<Mutex<HashMap<String, HeapRegion>>>,
}

impl SimRegionFactory
{
    pub fn open(&self, name: &str) -> Option<HeapRegion>
    {
        self.regions.lock().unwrap().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String>
    {
        self.regions.lock().unwrap().keys().cloned().collect()
    }
}

impl RegionFactory for SimRegionFactory
{
    fn create(&self, name: &str, size: usize) -> Result<Box<dyn MappedRegion>>
    {
        let region = HeapRegion::new(size);
        self.regions.lock().unwrap().insert(name.to_string(), region.clone());
        Ok(Box::new(region))
    }
}

struct SimThread
{
    context: DebugContext,
    suspend_count: u32,
}

struct SimState
{
    allocations: BTreeMap<u64, Vec<u8>>,
    protections: HashMap<u64, Protection>,
    modules: Vec<ModuleInfo>,
    exports: HashMap<u64, String>,
    threads: BTreeMap<ThreadId, SimThread>,
    agent: Option<Arc<AgentChannel>>,
    ops: Vec<Op>,
    next_heap: u64,
    next_remote_thread: u32,
    crashed: bool,
    knobs: Knobs,
}

impl SimState
{
    fn allocation(&self, address: Address, size: usize) -> Option<(u64, usize)>
    {
        let (&base, bytes) = self.allocations.range(..=address.value()).next_back()?;
        let offset = usize::try_from(address.value() - base).ok()?;
        (offset + size <= bytes.len()).then_some((base, offset))
    }

    fn set_protection(&mut self, base: u64, size: u64, protection: Protection)
    {
        let mut page = base & !(PAGE_SIZE - 1);
        while page < base + size {
            self.protections.insert(page, protection);
            page += PAGE_SIZE;
        }
    }

    fn for_each_context(&mut self, mut apply: impl FnMut(&mut DebugContext))
    {
        for thread in self.threads.values_mut() {
            apply(&mut thread.context);
        }
    }
}

fn put_u16(image: &mut [u8], offset: usize, value: u16)
{
    image[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(image: &mut [u8], offset: usize, value: u32)
{
    image[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Build a minimal PE image exporting `exports` (name, function RVA)
pub fn pe_image(bitness: Bitness, exports: &[(&str, u32)]) -> Vec<u8>
{
    let mut image = vec![0u8; AGENT_IMAGE_SIZE];
    let nt = 0x80usize;
    image[0..2].copy_from_slice(b"MZ");
    put_u32(&mut image, 0x3C, nt as u32);
    image[nt..nt + 4].copy_from_slice(b"PE\0\0");

    let file_header = nt + 4;
    let optional = file_header + 20;
    let (machine, magic, header_size, directories_at, rva_count_at) = match bitness {
        Bitness::X64 => (0x8664u16, 0x20Bu16, 112 + 16 * 8, 112usize, 108usize),
        Bitness::X86 => (0x014Cu16, 0x10Bu16, 96 + 16 * 8, 96usize, 92usize),
    };
    put_u16(&mut image, file_header, machine);
    put_u16(&mut image, file_header + 16, header_size);
    put_u16(&mut image, optional, magic);
    put_u32(&mut image, optional + rva_count_at, 16);

    let directory = EXPORT_DIRECTORY_RVA as usize;
    let count = exports.len();
    let functions = directory + 40;
    let names = functions + 4 * count;
    let ordinals = names + 4 * count;
    let mut strings = ordinals + 2 * count;

    put_u32(&mut image, directory + 16, 1);
    put_u32(&mut image, directory + 20, count as u32);
    put_u32(&mut image, directory + 24, count as u32);
    put_u32(&mut image, directory + 28, functions as u32);
    put_u32(&mut image, directory + 32, names as u32);
    put_u32(&mut image, directory + 36, ordinals as u32);

    for (index, (name, rva)) in exports.iter().enumerate() {
        put_u32(&mut image, functions + 4 * index, *rva);
        put_u32(&mut image, names + 4 * index, strings as u32);
        put_u16(&mut image, ordinals + 2 * index, index as u16);
        image[strings..strings + name.len()].copy_from_slice(name.as_bytes());
        strings += name.len() + 1;
    }

    let directory_size = (strings - directory) as u32;
    put_u32(&mut image, optional + directories_at, EXPORT_DIRECTORY_RVA);
    put_u32(&mut image, optional + directories_at + 4, directory_size);
    image
}

/// RVA of the `index`th agent export's code
pub const fn export_rva(index: usize) -> u32
{
    EXPORT_CODE_RVA + 0x10 * index as u32
}

struct SimRemoteThread
{
    id: ThreadId,
    exit: ThreadExit,
}

impl RemoteThread for SimRemoteThread
{
    fn id(&self) -> ThreadId
    {
        self.id
    }

    fn join(&mut self, _timeout: Duration) -> Result<ThreadExit>
    {
        Ok(self.exit)
    }
}

/// In-memory process with three threads and one module (`game.exe`)
pub struct SimulatedTarget
{
    pid: ProcessId,
    bitness: Bitness,
    regions: SimRegionFactory,
    state: Mutex<SimState>,
}

impl SimulatedTarget
{
    pub fn new(bitness: Bitness) -> Self
    {
        let mut state = SimState {
            allocations: BTreeMap::new(),
            protections: HashMap::new(),
            modules: vec![ModuleInfo::new("game.exe", Address::new(GAME_BASE), GAME_SIZE)],
            exports: HashMap::new(),
            threads: THREADS
                .iter()
                .map(|&id| {
                    (
                        ThreadId(id),
                        SimThread {
                            context: DebugContext::default(),
                            suspend_count: 0,
                        },
                    )
                })
                .collect(),
            agent: None,
            ops: Vec::new(),
            next_heap: match bitness {
                Bitness::X64 => 0x0000_01F0_0000_0000,
                Bitness::X86 => 0x0200_0000,
            },
            next_remote_thread: 9000,
            crashed: false,
            knobs: Knobs::default(),
        };
        state.allocations.insert(GAME_BASE, vec![0u8; GAME_SIZE as usize]);
        state.set_protection(GAME_BASE, GAME_SIZE, Protection::READ_WRITE);

        Self {
            pid: ProcessId(4242),
            bitness,
            regions: SimRegionFactory::default(),
            state: Mutex::new(state),
        }
    }

    pub fn shared(bitness: Bitness) -> Arc<Self>
    {
        Arc::new(Self::new(bitness))
    }

    /// Region factory whose regions the simulated agent can open
    pub fn regions(&self) -> SimRegionFactory
    {
        self.regions.clone()
    }

    pub fn configure(&self, apply: impl FnOnce(&mut Knobs))
    {
        apply(&mut self.state.lock().unwrap().knobs);
    }

    /// Allocate `size` bytes of read-write heap (outside every module).
    pub fn heap_alloc(&self, size: usize) -> Address
    {
        self.allocate(size, Protection::READ_WRITE).unwrap()
    }

    /// Place `bytes` at `base` as if a loader had mapped them.
    pub fn map(&self, base: Address, bytes: Vec<u8>)
    {
        let mut state = self.state.lock().unwrap();
        let size = bytes.len() as u64;
        state.allocations.insert(base.value(), bytes);
        state.set_protection(base.value(), size, Protection::READ_ONLY);
    }

    pub fn set_protection(&self, address: Address, protection: Protection)
    {
        self.state
            .lock()
            .unwrap()
            .set_protection(address.page_base(PAGE_SIZE).value(), PAGE_SIZE, protection);
    }

    pub fn protection(&self, address: Address) -> Protection
    {
        let state = self.state.lock().unwrap();
        state
            .protections
            .get(&address.page_base(PAGE_SIZE).value())
            .copied()
            .unwrap_or(Protection(0))
    }

    pub fn context(&self, thread: ThreadId) -> DebugContext
    {
        self.state.lock().unwrap().threads[&thread].context
    }

    /// Leave `thread` between a guard fault and its single-step.
    pub fn set_trap_flag(&self, thread: ThreadId)
    {
        if let Some(sim) = self.state.lock().unwrap().threads.get_mut(&thread) {
            sim.context.flags |= TRAP_FLAG;
        }
    }

    pub fn ops(&self) -> Vec<Op>
    {
        self.state.lock().unwrap().ops.clone()
    }

    pub fn clear_ops(&self)
    {
        self.state.lock().unwrap().ops.clear();
    }

    pub fn agent_channel(&self) -> Option<Arc<AgentChannel>>
    {
        self.state.lock().unwrap().agent.clone()
    }

    pub fn is_allocated(&self, address: Address) -> bool
    {
        self.state.lock().unwrap().allocations.contains_key(&address.value())
    }

    pub fn suspended_threads(&self) -> usize
    {
        let state = self.state.lock().unwrap();
        state.threads.values().filter(|thread| thread.suspend_count > 0).count()
    }

    /// Whether an exception went unhandled (the real target would have died)
    pub fn crashed(&self) -> bool
    {
        self.state.lock().unwrap().crashed
    }

    /// Play one access by `thread`; returns whether the agent recorded a hit
    pub fn access(&self, thread: ThreadId, address: Address, write: bool) -> bool
    {
        let mut state = self.state.lock().unwrap();
        let agent = state.agent.clone().filter(|agent| agent.is_valid());
        let page = address.page_base(PAGE_SIZE).value();
        let mut recorded = false;

        let protection = state.protections.get(&page).copied().unwrap_or(Protection(0));
        if protection.is_guarded() {
            // One-shot: the OS removes the guard before raising the fault
            state.protections.insert(page, Protection(protection.bits() & !Protection::GUARD.bits()));
            match &agent {
                None => state.crashed = true,
                Some(agent) => {
                    let _scope = agent.enter_handler();
                    let header = agent.header();
                    let watched = address.value() >= header.watch_address
                        && address.value() < header.watch_address + u64::from(header.breakpoint_size);
                    if agent.is_active() && watched {
                        agent.record_hit(address, thread);
                        recorded = true;
                    }
                    // The single-step after the access re-arms the guard
                    if agent.is_active() {
                        let original = Protection(header.original_protection);
                        state.protections.insert(page, original.with_guard());
                    }
                }
            }
        }

        let context = state.threads[&thread].context;
        let fired = SlotIndex::ALL.iter().any(|&slot| {
            Dr7(context.dr7).decode(slot).is_some_and(|(condition, size)| {
                let start = context.dr[slot.index()];
                let matches_kind = match condition {
                    BreakCondition::Write => write,
                    BreakCondition::ReadWrite => true,
                    _ => false,
                };
                matches_kind && address.value() >= start && address.value() < start + u64::from(size.len())
            })
        });
        if fired {
            match &agent {
                None => state.crashed = true,
                Some(agent) => {
                    let _scope = agent.enter_handler();
                    if agent.is_active() {
                        agent.record_hit(address, thread);
                        recorded = true;
                    }
                }
            }
        }
        recorded
    }

    fn run_export(&self, state: &mut SimState, name: &str, args: &[u64]) -> u32
    {
        match name {
            "init" => {
                if state.knobs.fail_init {
                    return 0;
                }
                let Some((base, offset)) = state.allocation(Address::new(args[0]), 2) else {
                    return 0;
                };
                let units: Vec<u16> = state.allocations[&base][offset..]
                    .chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                    .take_while(|&unit| unit != 0)
                    .collect();
                let channel_name = String::from_utf16_lossy(&units);
                let Some(region) = self.regions.open(&channel_name) else {
                    return 0;
                };
                match AgentChannel::open(Box::new(region)) {
                    Ok(channel) => {
                        state.agent = Some(Arc::new(channel));
                        1
                    }
                    Err(_) => 0,
                }
            }
            "uninit" => {
                state.agent = None;
                0
            }
            "installBreakpoint" => {
                if state.knobs.install_returns_zero {
                    return 0;
                }
                let (slot, address, kind, size) = match self.bitness {
                    Bitness::X64 => (args[0], args[1], args[2], args[3]),
                    Bitness::X86 => (args[0], args[1] | (args[2] << 32), args[3], args[4]),
                };
                let (Ok(slot), Ok(size)) = (SlotIndex::new(slot as u8), BreakSize::from_len(size as u32)) else {
                    return 0;
                };
                let condition = BreakCondition::from_bits(kind);
                state.for_each_context(|context| context.program(slot, Address::new(address), condition, size));
                1
            }
            "clearBreakpoint" => {
                if let Ok(slot) = SlotIndex::new(args[0] as u8) {
                    state.for_each_context(|context| context.clear(slot));
                    return 1;
                }
                0
            }
            "refresh" => {
                let Some(agent) = state.agent.clone().filter(|agent| agent.is_valid() && agent.is_active()) else {
                    return 0;
                };
                let header = agent.header();
                if header.use_page_guard != 0 {
                    let guarded = Protection(header.original_protection).with_guard();
                    state.set_protection(header.page_base, u64::from(header.page_size), guarded);
                    return 1;
                }
                let (Ok(slot), Ok(size)) = (
                    SlotIndex::new(header.breakpoint_slot as u8),
                    BreakSize::from_len(header.breakpoint_size),
                ) else {
                    return 0;
                };
                let condition = BreakCondition::from_bits(u64::from(header.breakpoint_type));
                let address = Address::new(header.watch_address);
                state.for_each_context(|context| context.program(slot, address, condition, size));
                1
            }
            _ => 0,
        }
    }

    fn thread_mut<'a>(state: &'a mut SimState, thread: ThreadId, operation: &'static str) -> Result<&'a mut SimThread>
    {
        state.threads.get_mut(&thread).ok_or_else(|| TripwireError::ThreadFailed {
            thread,
            operation,
            reason: "no such thread".to_string(),
        })
    }
}

/// Controller configuration tuned for the simulation
pub fn test_config() -> SessionConfig
{
    SessionConfig::default()
        .with_agent_path(std::env::current_exe().unwrap())
        .with_agent_settle_delay(Duration::ZERO)
        .with_poll_interval(Duration::from_millis(5))
        .with_handler_drain_timeout(Duration::from_millis(50))
        .with_remote_call_timeout(Duration::from_millis(200))
}

impl ProcessAccess for SimulatedTarget
{
    fn pid(&self) -> ProcessId
    {
        self.pid
    }

    fn bitness(&self) -> Bitness
    {
        self.bitness
    }

    fn read(&self, address: Address, size: usize) -> Result<Vec<u8>>
    {
        let state = self.state.lock().unwrap();
        let (base, offset) = state.allocation(address, size).ok_or_else(|| TripwireError::ReadFailed {
            address,
            size,
            reason: "unmapped".to_string(),
        })?;
        Ok(state.allocations[&base][offset..offset + size].to_vec())
    }

    fn write(&self, address: Address, bytes: &[u8]) -> Result<()>
    {
        let mut state = self.state.lock().unwrap();
        let (base, offset) = state.allocation(address, bytes.len()).ok_or_else(|| TripwireError::WriteFailed {
            address,
            size: bytes.len(),
            reason: "unmapped".to_string(),
        })?;
        if let Some(allocation) = state.allocations.get_mut(&base) {
            allocation[offset..offset + bytes.len()].copy_from_slice(bytes);
        }
        Ok(())
    }

    fn allocate(&self, size: usize, protection: Protection) -> Result<Address>
    {
        let mut state = self.state.lock().unwrap();
        let base = state.next_heap;
        let pages = (size as u64).div_ceil(PAGE_SIZE).max(1);
        state.next_heap += (pages + 1) * PAGE_SIZE;
        state.allocations.insert(base, vec![0u8; size]);
        state.set_protection(base, pages * PAGE_SIZE, protection);
        Ok(Address::new(base))
    }

    fn free(&self, address: Address) -> Result<()>
    {
        let mut state = self.state.lock().unwrap();
        state.ops.push(Op::Free(address));
        state
            .allocations
            .remove(&address.value())
            .map(|_| ())
            .ok_or_else(|| TripwireError::AllocationFailed(format!("{address} is not an allocation base")))
    }

    fn protect(&self, address: Address, size: usize, protection: Protection) -> Result<Protection>
    {
        let mut state = self.state.lock().unwrap();
        let page = address.page_base(PAGE_SIZE).value();
        let old = state
            .protections
            .get(&page)
            .copied()
            .ok_or_else(|| TripwireError::ProtectionChangeFailed {
                address,
                reason: "unmapped".to_string(),
            })?;
        state.set_protection(page, size as u64, protection);
        state.ops.push(Op::Protect { address, protection });
        Ok(old)
    }

    fn query_region(&self, address: Address) -> Result<RegionInfo>
    {
        let state = self.state.lock().unwrap();
        let page = address.page_base(PAGE_SIZE);
        let committed = state.allocation(address, 1).is_some();
        Ok(RegionInfo {
            base: page,
            size: PAGE_SIZE,
            protection: state.protections.get(&page.value()).copied().unwrap_or(Protection(0)),
            committed,
        })
    }

    fn start_remote_thread(&self, entry: Address, _argument: u64) -> Result<Box<dyn RemoteThread>>
    {
        let mut state = self.state.lock().unwrap();
        let (base, offset) = state.allocation(entry, 1).ok_or_else(|| TripwireError::RemoteCallFailed(format!("no code at {entry}")))?;
        let code = state.allocations[&base][offset..].to_vec();
        let call = CallEncoder::new(self.bitness).decode(&code)?;

        let name = state
            .exports
            .get(&call.function.value())
            .cloned()
            .unwrap_or_else(|| format!("{}", call.function));
        state.ops.push(Op::RemoteCall(name.clone()));

        let id = ThreadId(state.next_remote_thread);
        state.next_remote_thread += 1;

        let exit = if state.knobs.hang_export == Some(name.as_str()) {
            ThreadExit::TimedOut
        } else {
            ThreadExit::Exited(self.run_export(&mut state, &name, &call.args))
        };
        Ok(Box::new(SimRemoteThread { id, exit }))
    }

    fn enumerate_modules(&self, _force_refresh: bool) -> Result<Vec<ModuleInfo>>
    {
        let state = self.state.lock().unwrap();
        if state.knobs.fail_module_enumeration {
            return Err(TripwireError::ModuleEnumerationFailed("snapshot denied".to_string()));
        }
        Ok(state.modules.clone())
    }

    fn load_module_into_target(&self, path: &Path) -> Result<Address>
    {
        let mut state = self.state.lock().unwrap();
        if !state.allocations.contains_key(&AGENT_BASE) {
            let exports: Vec<(&str, u32)> = AGENT_EXPORTS
                .iter()
                .enumerate()
                .filter(|(_, name)| !state.knobs.omit_exports.contains(name))
                .map(|(index, name)| (*name, export_rva(index)))
                .collect();
            for (name, rva) in &exports {
                state.exports.insert(AGENT_BASE + u64::from(*rva), (*name).to_string());
            }
            let image = pe_image(self.bitness, &exports);
            state.allocations.insert(AGENT_BASE, image);
            state.set_protection(AGENT_BASE, AGENT_IMAGE_SIZE as u64, Protection::EXECUTE_READ);

            let name = path.file_name().map(|name| name.to_string_lossy().into_owned()).unwrap_or_default();
            state
                .modules
                .push(ModuleInfo::new(name, Address::new(AGENT_BASE), AGENT_IMAGE_SIZE as u64));
        }
        Ok(Address::new(AGENT_BASE))
    }
}

impl ThreadControl for SimulatedTarget
{
    fn thread_ids(&self) -> Result<Vec<ThreadId>>
    {
        Ok(self.state.lock().unwrap().threads.keys().copied().collect())
    }

    fn suspend_thread(&self, thread: ThreadId) -> Result<ThreadHandle>
    {
        let mut state = self.state.lock().unwrap();
        if state.knobs.unsuspendable.contains(&thread) {
            return Err(TripwireError::ThreadFailed {
                thread,
                operation: "suspend",
                reason: "access denied".to_string(),
            });
        }
        Self::thread_mut(&mut state, thread, "suspend")?.suspend_count += 1;
        state.ops.push(Op::Suspend(thread));
        Ok(ThreadHandle {
            id: thread,
            raw: thread.0 as usize,
        })
    }

    fn resume_thread(&self, handle: ThreadHandle) -> Result<()>
    {
        let mut state = self.state.lock().unwrap();
        let channel_valid = state.agent.as_ref().map(|agent| agent.is_valid());
        let sim = Self::thread_mut(&mut state, handle.id, "resume")?;
        if sim.suspend_count == 0 {
            return Err(TripwireError::ThreadFailed {
                thread: handle.id,
                operation: "resume",
                reason: "not suspended".to_string(),
            });
        }
        sim.suspend_count -= 1;
        state.ops.push(Op::Resume {
            thread: handle.id,
            channel_valid,
        });
        Ok(())
    }

    fn read_debug_context(&self, handle: &ThreadHandle) -> Result<DebugContext>
    {
        let mut state = self.state.lock().unwrap();
        let sim = Self::thread_mut(&mut state, handle.id, "get context")?;
        if sim.suspend_count == 0 {
            return Err(TripwireError::ThreadFailed {
                thread: handle.id,
                operation: "get context",
                reason: "thread is running".to_string(),
            });
        }
        Ok(sim.context)
    }

    fn write_debug_context(&self, handle: &ThreadHandle, context: &DebugContext) -> Result<()>
    {
        let mut state = self.state.lock().unwrap();
        let sim = Self::thread_mut(&mut state, handle.id, "set context")?;
        if sim.suspend_count == 0 {
            return Err(TripwireError::ThreadFailed {
                thread: handle.id,
                operation: "set context",
                reason: "thread is running".to_string(),
            });
        }
        sim.context = *context;
        Ok(())
    }
}
