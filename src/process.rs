//! The process controller.
//!
//! A [`Process`] owns one inferior: it launches or attaches to it, drives it
//! through resume/step/wait transitions, classifies stops into
//! [`StopReason`]s, serves register and memory I/O, and allocates the four
//! hardware debug registers for the stoppoints it owns.
//!
//! All kernel debugging calls go through here; breakpoint sites and
//! watchpoints route their hardware effects through the controller rather
//! than touching the inferior themselves.

use std::collections::HashMap;
use std::ffi::CString;
use std::io::IoSliceMut;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;

use nix::libc;
use nix::sys::personality::{self, Persona};
use nix::sys::ptrace::{self, AddressType, Options};
use nix::sys::signal::{kill, Signal};
use nix::sys::uio::{process_vm_readv, RemoteIoVec};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};
use tracing::{debug, trace, warn};

use crate::addr::VirtAddr;
use crate::consts::{AT_ENTRY, INT3, PAGE_SIZE, SI_KERNEL, TRAP_HWBKPT, TRAP_TRACE};
use crate::errors::{DebuggerError, OsErrorExt, Result};
use crate::pipe::Pipe;
use crate::register_info::{register_info_by_id, RegisterId, RegisterInfo, RegisterKind, DR_IDS};
use crate::registers::{RegisterValue, Registers};
use crate::stoppoint::{
    BreakpointSite, StoppointCollection, StoppointId, StoppointMode, Watchpoint, INTERNAL_ID,
};

const SIGTRAP_INFO: u8 = Signal::SIGTRAP as i32 as u8;

/// Execution state of the inferior as tracked by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Stopped,
    Exited,
    Terminated,
}

/// What kind of trap produced a `SIGTRAP` stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapType {
    SingleStep,
    SoftwareBreakpoint,
    HardwareBreakpoint,
    Syscall,
    Unknown,
}

/// Which syscalls trigger reportable stops while resuming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyscallCatchPolicy {
    None,
    All,
    Some(Vec<u16>),
}

/// Entry arguments or exit value of a traced syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallData {
    Args([u64; 6]),
    ReturnValue(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallInfo {
    pub id: u16,
    pub entry: bool,
    pub data: SyscallData,
}

/// The decoded outcome of one wait on the inferior.
#[derive(Debug, Clone, Copy)]
pub struct StopReason {
    pub state: ProcessState,
    /// Exit code for `Exited`, signal number otherwise.
    pub info: u8,
    pub trap: Option<TrapType>,
    pub syscall: Option<SyscallInfo>,
}

/// Identifies which hardware stoppoint DR6 reports as triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareStoppoint {
    Breakpoint(StoppointId),
    Watchpoint(StoppointId),
}

/// Relays a child-side setup failure to the parent and dies. Only called
/// between fork and exec.
fn exit_with_error(channel: &Pipe, prefix: &str, err: &dyn std::fmt::Display) -> ! {
    let _ = channel.write(format!("{prefix}: {err}").as_bytes());
    unsafe { libc::_exit(-1) }
}

/// Probes liveness of a PID by sending signal 0.
pub fn process_exists(pid: Pid) -> bool {
    kill(pid, None).is_ok()
}

/// The single-character run state from `/proc/<pid>/stat` (third field,
/// after the last `)`), e.g. `'t'` for tracing-stopped.
pub fn process_state(pid: Pid) -> Result<char> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat"))?;
    let after_paren = stat
        .rfind(')')
        .and_then(|i| stat[i..].chars().nth(2))
        .ok_or(DebuggerError::InvalidPid)?;
    Ok(after_paren)
}

pub struct Process {
    pid: Pid,
    terminate_on_end: bool,
    is_attached: bool,
    state: ProcessState,
    registers: Registers,
    breakpoint_sites: StoppointCollection<BreakpointSite>,
    watchpoints: StoppointCollection<Watchpoint>,
    syscall_catch_policy: SyscallCatchPolicy,
    expecting_syscall_exit: bool,
}

impl Process {
    fn new(pid: Pid, terminate_on_end: bool, is_attached: bool) -> Self {
        Process {
            pid,
            terminate_on_end,
            is_attached,
            state: ProcessState::Stopped,
            registers: Registers::new(),
            breakpoint_sites: StoppointCollection::default(),
            watchpoints: StoppointCollection::default(),
            syscall_catch_policy: SyscallCatchPolicy::None,
            expecting_syscall_exit: false,
        }
    }

    /// Forks and execs the program at `path`. The child puts itself in its
    /// own process group, disables address-space randomization, optionally
    /// redirects stdout, and requests tracing when `debug` is set. Child-side
    /// setup failures are relayed through a close-on-exec pipe and reported
    /// as [`DebuggerError::Launch`].
    pub fn launch(
        path: impl AsRef<Path>,
        debug: bool,
        stdout_replacement: Option<OwnedFd>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let mut channel = Pipe::new(true)?;

        match unsafe { unistd::fork() }.op("fork")? {
            ForkResult::Child => {
                Self::exec_inferior(path, debug, stdout_replacement, &mut channel);
                // exec_inferior never returns
                unreachable!()
            }
            ForkResult::Parent { child } => {
                channel.close_write();
                let data = channel.read()?;
                channel.close_read();

                if !data.is_empty() {
                    let _ = waitpid(child, None);
                    return Err(DebuggerError::Launch(
                        String::from_utf8_lossy(&data).into_owned(),
                    ));
                }

                debug!("launched {} as pid {child}", path.display());
                let mut process = Process::new(child, true, debug);
                if debug {
                    process.wait_on_signal()?;
                    process.set_ptrace_options()?;
                }
                Ok(process)
            }
        }
    }

    fn exec_inferior(
        path: &Path,
        debug: bool,
        stdout_replacement: Option<OwnedFd>,
        channel: &mut Pipe,
    ) {
        channel.close_read();

        // a fresh process group keeps shell signals away from the inferior
        if let Err(e) = unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0)) {
            exit_with_error(channel, "Could not set pgid", &e);
        }
        if let Err(e) = personality::set(Persona::ADDR_NO_RANDOMIZE) {
            exit_with_error(channel, "Could not disable ASLR", &e);
        }
        if let Some(fd) = stdout_replacement {
            if let Err(e) = unistd::dup2(fd.as_raw_fd(), libc::STDOUT_FILENO) {
                exit_with_error(channel, "stdout replacement failed", &e);
            }
        }
        if debug {
            if let Err(e) = ptrace::traceme() {
                exit_with_error(channel, "Tracing failed", &e);
            }
        }

        let prog = match CString::new(path.as_os_str().as_encoded_bytes()) {
            Ok(c) => c,
            Err(e) => exit_with_error(channel, "Bad program path", &e),
        };
        let err = unistd::execvp(&prog, &[prog.clone()]).unwrap_err();
        exit_with_error(channel, "exec failed", &err);
    }

    /// Attaches to an already-running process and waits for it to stop.
    pub fn attach(pid: Pid) -> Result<Self> {
        if pid.as_raw() == 0 {
            return Err(DebuggerError::InvalidPid);
        }
        ptrace::attach(pid).op("attach")?;

        let mut process = Process::new(pid, false, true);
        process.wait_on_signal()?;
        process.set_ptrace_options()?;
        Ok(process)
    }

    fn set_ptrace_options(&self) -> Result<()> {
        // TRACESYSGOOD makes syscall stops distinguishable from plain SIGTRAP
        ptrace::setoptions(self.pid, Options::PTRACE_O_TRACESYSGOOD).op("set ptrace options")
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn exists(&self) -> bool {
        process_exists(self.pid)
    }

    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    pub fn breakpoint_sites(&self) -> &StoppointCollection<BreakpointSite> {
        &self.breakpoint_sites
    }

    pub fn watchpoints(&self) -> &StoppointCollection<Watchpoint> {
        &self.watchpoints
    }

    pub fn set_syscall_catch_policy(&mut self, policy: SyscallCatchPolicy) {
        self.syscall_catch_policy = policy;
    }

    pub fn get_pc(&self) -> VirtAddr {
        VirtAddr::new(self.registers.read_as_u64(RegisterId::rip))
    }

    pub fn set_pc(&mut self, address: VirtAddr) -> Result<()> {
        self.write_register_by_id(RegisterId::rip, RegisterValue::U64(address.addr()))
    }

    /// Resumes the inferior. If the program counter sits on an enabled
    /// software breakpoint, the site is disabled, the displaced instruction
    /// is stepped over, and the site is re-enabled before continuing.
    pub fn resume(&mut self) -> Result<()> {
        if matches!(self.state, ProcessState::Exited | ProcessState::Terminated) {
            return Err(DebuggerError::ResumeAfterTerminal);
        }

        let pc = self.get_pc();
        if self.breakpoint_sites.enabled_stoppoint_at_address(pc) {
            trace!("stepping over breakpoint at {pc}");
            self.disable_breakpoint_site_at_address(pc)?;
            ptrace::step(self.pid, None).op("single step")?;
            let status = waitpid(self.pid, None).op("waitpid")?;
            // the step can race with process death; don't touch the corpse
            match status {
                WaitStatus::Exited(_, code) => {
                    self.state = ProcessState::Exited;
                    warn!("inferior exited with {code} during breakpoint step-over");
                    return Err(DebuggerError::ExitedDuringStep);
                }
                WaitStatus::Signaled(_, signal, _) => {
                    self.state = ProcessState::Terminated;
                    warn!("inferior terminated by {signal} during breakpoint step-over");
                    return Err(DebuggerError::ExitedDuringStep);
                }
                _ => {}
            }
            self.enable_breakpoint_site_at_address(pc)?;
        }

        if self.syscall_catch_policy == SyscallCatchPolicy::None {
            ptrace::cont(self.pid, None).op("resume")?;
        } else {
            ptrace::syscall(self.pid, None).op("resume")?;
        }
        self.state = ProcessState::Running;
        Ok(())
    }

    /// Executes a single instruction and returns the classified stop. A
    /// breakpoint at the current program counter is stepped over in place.
    pub fn step_instruction(&mut self) -> Result<StopReason> {
        let mut to_reenable = None;
        let pc = self.get_pc();
        if self.breakpoint_sites.enabled_stoppoint_at_address(pc) {
            self.disable_breakpoint_site_at_address(pc)?;
            to_reenable = Some(pc);
        }

        ptrace::step(self.pid, None).op("single step")?;
        let reason = self.wait_on_signal()?;

        if let Some(address) = to_reenable {
            if self.state == ProcessState::Stopped {
                self.enable_breakpoint_site_at_address(address)?;
            }
        }
        Ok(reason)
    }

    /// Delivers `SIGSTOP` to a running inferior and reaps the stop.
    pub fn stop(&mut self) -> Result<()> {
        if self.state == ProcessState::Running {
            kill(self.pid, Signal::SIGSTOP).op("stop inferior")?;
            self.wait_on_signal()?;
        }
        Ok(())
    }

    fn decode_wait_status(&self, status: WaitStatus) -> StopReason {
        let (state, info, trap) = match status {
            WaitStatus::Exited(_, code) => (ProcessState::Exited, code as u8, None),
            WaitStatus::Signaled(_, signal, _) => {
                (ProcessState::Terminated, signal as i32 as u8, None)
            }
            WaitStatus::Stopped(_, signal) => (ProcessState::Stopped, signal as i32 as u8, None),
            // a TRACESYSGOOD stop: SIGTRAP | 0x80, normalized to SIGTRAP
            WaitStatus::PtraceSyscall(_) => {
                (ProcessState::Stopped, SIGTRAP_INFO, Some(TrapType::Syscall))
            }
            _ => (ProcessState::Running, 0, None),
        };
        StopReason {
            state,
            info,
            trap,
            syscall: None,
        }
    }

    /// Blocks until the inferior reports a status, refreshes the register
    /// snapshot, classifies the stop, fixes up the program counter after
    /// software breakpoints, and applies the syscall catch policy.
    pub fn wait_on_signal(&mut self) -> Result<StopReason> {
        let status = waitpid(self.pid, None).op("waitpid")?;
        let mut reason = self.decode_wait_status(status);
        self.state = reason.state;
        trace!("wait: {status:?}");

        if self.is_attached && self.state == ProcessState::Stopped {
            self.read_all_registers()?;
            self.augment_stop_reason(&mut reason)?;

            if reason.info == SIGTRAP_INFO {
                match reason.trap {
                    Some(TrapType::SoftwareBreakpoint) => {
                        // the int3 byte has executed; rewind onto the site
                        let instruction_begin = self.get_pc() - 1;
                        if self
                            .breakpoint_sites
                            .enabled_stoppoint_at_address(instruction_begin)
                        {
                            self.set_pc(instruction_begin)?;
                        }
                    }
                    Some(TrapType::HardwareBreakpoint) => {
                        if let HardwareStoppoint::Watchpoint(id) =
                            self.get_current_hardware_stoppoint()?
                        {
                            self.update_watchpoint_data(id)?;
                        }
                    }
                    Some(TrapType::Syscall) => {
                        reason = self.maybe_resume_from_syscall(reason)?;
                    }
                    _ => {}
                }
            }
        }

        Ok(reason)
    }

    fn augment_stop_reason(&mut self, reason: &mut StopReason) -> Result<()> {
        if reason.trap == Some(TrapType::Syscall) {
            let id = self.registers.read_as_u64(RegisterId::orig_rax) as u16;
            let info = if self.expecting_syscall_exit {
                self.expecting_syscall_exit = false;
                SyscallInfo {
                    id,
                    entry: false,
                    data: SyscallData::ReturnValue(self.registers.read_as_u64(RegisterId::rax)),
                }
            } else {
                self.expecting_syscall_exit = true;
                const ARG_REGISTERS: [RegisterId; 6] = [
                    RegisterId::rdi,
                    RegisterId::rsi,
                    RegisterId::rdx,
                    RegisterId::r10,
                    RegisterId::r8,
                    RegisterId::r9,
                ];
                let mut args = [0u64; 6];
                for (arg, reg) in args.iter_mut().zip(ARG_REGISTERS) {
                    *arg = self.registers.read_as_u64(reg);
                }
                SyscallInfo {
                    id,
                    entry: true,
                    data: SyscallData::Args(args),
                }
            };
            reason.syscall = Some(info);
            return Ok(());
        }

        // any non-syscall stop resets the entry/exit alternation
        self.expecting_syscall_exit = false;

        if reason.info == SIGTRAP_INFO {
            let siginfo = ptrace::getsiginfo(self.pid).op("get siginfo")?;
            reason.trap = Some(match siginfo.si_code {
                TRAP_TRACE => TrapType::SingleStep,
                // the kernel reports SI_KERNEL for int3 on x86-64
                SI_KERNEL => TrapType::SoftwareBreakpoint,
                TRAP_HWBKPT => TrapType::HardwareBreakpoint,
                _ => TrapType::Unknown,
            });
        }
        Ok(())
    }

    fn maybe_resume_from_syscall(&mut self, reason: StopReason) -> Result<StopReason> {
        if let SyscallCatchPolicy::Some(to_catch) = &self.syscall_catch_policy {
            if let Some(syscall) = &reason.syscall {
                if !to_catch.contains(&syscall.id) {
                    // not interesting; resume transparently and keep waiting
                    self.resume()?;
                    return self.wait_on_signal();
                }
            }
        }
        Ok(reason)
    }

    fn read_all_registers(&mut self) -> Result<()> {
        *self.registers.gprs_mut() = ptrace::getregs(self.pid).op("read GPRs")?;
        *self.registers.fprs_mut() =
            ptrace::getregset::<ptrace::regset::NT_PRFPREG>(self.pid).op("read FPRs")?;
        for (index, id) in DR_IDS.iter().enumerate() {
            let info = register_info_by_id(*id);
            let data = ptrace::read_user(self.pid, info.offset as AddressType)
                .op("read debug register")?;
            self.registers.set_debug_register(index, data as u64);
        }
        Ok(())
    }

    /// Writes a register value: the snapshot is updated first, then the
    /// change is pushed to the inferior. FPR changes go as one block (the
    /// kernel does not accept partial x87 writes); GPRs and debug registers
    /// go through an aligned user-area poke.
    pub fn write_register(&mut self, info: &'static RegisterInfo, value: RegisterValue) -> Result<()> {
        self.registers.write(info, value)?;
        if info.kind == RegisterKind::Fpr {
            self.write_fprs()
        } else {
            let aligned_offset = info.offset & !0b111;
            self.poke_user_area(aligned_offset, self.registers.user_word_at(aligned_offset))
        }
    }

    pub fn write_register_by_id(&mut self, id: RegisterId, value: RegisterValue) -> Result<()> {
        self.write_register(register_info_by_id(id), value)
    }

    fn write_fprs(&self) -> Result<()> {
        ptrace::setregset::<ptrace::regset::NT_PRFPREG>(self.pid, *self.registers.fprs())
            .op("write FPRs")
    }

    fn poke_user_area(&self, offset: usize, word: u64) -> Result<()> {
        ptrace::write_user(self.pid, offset as AddressType, word as i64).op("write user area")
    }

    /// Reads inferior memory with a scatter read. The remote region is split
    /// on page boundaries so a partially unmapped range cannot produce an
    /// ambiguous short read within one descriptor.
    pub fn read_memory(&self, address: VirtAddr, amount: usize) -> Result<Vec<u8>> {
        let mut ret = vec![0u8; amount];
        if amount == 0 {
            return Ok(ret);
        }

        let mut remote_descs = Vec::new();
        let mut addr = address;
        let mut remaining = amount;
        while remaining > 0 {
            let up_to_next_page = (PAGE_SIZE - (addr.addr() & (PAGE_SIZE - 1))) as usize;
            let chunk = remaining.min(up_to_next_page);
            remote_descs.push(RemoteIoVec {
                base: addr.addr() as usize,
                len: chunk,
            });
            remaining -= chunk;
            addr += chunk as u64;
        }

        let mut local = [IoSliceMut::new(&mut ret)];
        process_vm_readv(self.pid, &mut local, &remote_descs).op("read process memory")?;
        Ok(ret)
    }

    /// Like [`read_memory`](Self::read_memory), but with every byte patched
    /// by an enabled software breakpoint replaced by the displaced original.
    pub fn read_memory_without_traps(&self, address: VirtAddr, amount: usize) -> Result<Vec<u8>> {
        let mut memory = self.read_memory(address, amount)?;
        for site in self
            .breakpoint_sites
            .in_region(address, address + amount as u64)
        {
            if !site.is_enabled() || site.is_hardware() {
                continue;
            }
            if let Some(saved) = site.saved_byte {
                let offset = site.address() - address;
                memory[offset as usize] = saved;
            }
        }
        Ok(memory)
    }

    pub fn read_memory_u64(&self, address: VirtAddr) -> Result<u64> {
        let bytes = self.read_memory(address, 8)?;
        Ok(u64::from_le_bytes(bytes[..8].try_into().unwrap()))
    }

    /// Writes memory word by word; a trailing sub-word is merged with the
    /// bytes already present.
    pub fn write_memory(&self, address: VirtAddr, data: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < data.len() {
            let remaining = data.len() - written;
            let word = if remaining >= 8 {
                u64::from_le_bytes(data[written..written + 8].try_into().unwrap())
            } else {
                let existing = self.read_memory(address + written as u64, 8)?;
                let mut bytes = [0u8; 8];
                bytes[..remaining].copy_from_slice(&data[written..]);
                bytes[remaining..].copy_from_slice(&existing[remaining..8]);
                u64::from_le_bytes(bytes)
            };
            ptrace::write(
                self.pid,
                (address + written as u64).addr() as AddressType,
                word as i64,
            )
            .op("write memory")?;
            written += 8;
        }
        Ok(())
    }

    /// Parses `/proc/<pid>/auxv` into an `AT_* -> value` map.
    pub fn get_auxiliary_vector(&self) -> Result<HashMap<u64, u64>> {
        let data = std::fs::read(format!("/proc/{}/auxv", self.pid))?;
        let mut auxv = HashMap::new();
        for entry in data.chunks_exact(16) {
            let id = u64::from_le_bytes(entry[..8].try_into().unwrap());
            if id == 0 {
                break;
            }
            let value = u64::from_le_bytes(entry[8..].try_into().unwrap());
            auxv.insert(id, value);
        }
        Ok(auxv)
    }

    /// The inferior's runtime entry point, from the auxiliary vector.
    pub fn entry_point(&self) -> Result<VirtAddr> {
        self.get_auxiliary_vector()?
            .get(&AT_ENTRY)
            .map(|&a| VirtAddr::new(a))
            .ok_or(DebuggerError::NoEntryPoint)
    }

    /// Registers a breakpoint site. The site starts disabled; internal sites
    /// carry the reserved id and are hidden from user listings.
    pub fn create_breakpoint_site(
        &mut self,
        address: VirtAddr,
        hardware: bool,
        internal: bool,
    ) -> Result<&mut BreakpointSite> {
        if self.breakpoint_sites.contains_address(address) {
            return Err(DebuggerError::StoppointExists(address.addr()));
        }
        let id = if internal {
            INTERNAL_ID
        } else {
            self.breakpoint_sites.allocate_id()
        };
        Ok(self
            .breakpoint_sites
            .push(BreakpointSite::new(id, address, hardware, internal)))
    }

    pub fn enable_breakpoint_site(&mut self, id: StoppointId) -> Result<()> {
        let site = self.breakpoint_sites.get_by_id(id)?;
        if site.is_enabled() {
            return Ok(());
        }
        let (address, hardware) = (site.address(), site.is_hardware());

        if hardware {
            let index = self.set_hardware_stoppoint(address, StoppointMode::Execute, 1)?;
            let site = self.breakpoint_sites.get_by_id_mut(id)?;
            site.hardware_index = Some(index);
            site.set_enabled(true);
        } else {
            let saved = self.patch_in_int3(address)?;
            let site = self.breakpoint_sites.get_by_id_mut(id)?;
            site.saved_byte = Some(saved);
            site.set_enabled(true);
        }
        Ok(())
    }

    pub fn disable_breakpoint_site(&mut self, id: StoppointId) -> Result<()> {
        let site = self.breakpoint_sites.get_by_id(id)?;
        if !site.is_enabled() {
            return Ok(());
        }
        let (address, hardware, index, saved) = (
            site.address(),
            site.is_hardware(),
            site.hardware_index,
            site.saved_byte,
        );

        if hardware {
            if let Some(index) = index {
                self.clear_hardware_stoppoint(index)?;
            }
            let site = self.breakpoint_sites.get_by_id_mut(id)?;
            site.hardware_index = None;
            site.set_enabled(false);
        } else if let Some(saved) = saved {
            self.patch_out_int3(address, saved)?;
            let site = self.breakpoint_sites.get_by_id_mut(id)?;
            site.saved_byte = None;
            site.set_enabled(false);
        }
        Ok(())
    }

    pub fn enable_breakpoint_site_at_address(&mut self, address: VirtAddr) -> Result<()> {
        let id = self.breakpoint_sites.get_by_address(address)?.id();
        self.enable_breakpoint_site(id)
    }

    pub fn disable_breakpoint_site_at_address(&mut self, address: VirtAddr) -> Result<()> {
        let id = self.breakpoint_sites.get_by_address(address)?.id();
        self.disable_breakpoint_site(id)
    }

    pub fn remove_breakpoint_site(&mut self, id: StoppointId) -> Result<()> {
        self.disable_breakpoint_site(id)?;
        self.breakpoint_sites.remove_by_id(id);
        Ok(())
    }

    pub fn remove_breakpoint_site_at_address(&mut self, address: VirtAddr) -> Result<()> {
        let id = self.breakpoint_sites.get_by_address(address)?.id();
        self.remove_breakpoint_site(id)
    }

    fn patch_in_int3(&self, address: VirtAddr) -> Result<u8> {
        let addr = address.addr() as AddressType;
        let word = ptrace::read(self.pid, addr).op("enable breakpoint site")? as u64;
        let saved = (word & 0xff) as u8;
        let patched = (word & !0xff) | u64::from(INT3);
        ptrace::write(self.pid, addr, patched as i64).op("enable breakpoint site")?;
        Ok(saved)
    }

    fn patch_out_int3(&self, address: VirtAddr, saved: u8) -> Result<()> {
        let addr = address.addr() as AddressType;
        let word = ptrace::read(self.pid, addr).op("disable breakpoint site")? as u64;
        let restored = (word & !0xff) | u64::from(saved);
        ptrace::write(self.pid, addr, restored as i64).op("disable breakpoint site")?;
        Ok(())
    }

    /// Registers a watchpoint. The watchpoint starts disabled.
    pub fn create_watchpoint(
        &mut self,
        address: VirtAddr,
        mode: StoppointMode,
        size: usize,
    ) -> Result<&mut Watchpoint> {
        if self.watchpoints.contains_address(address) {
            return Err(DebuggerError::StoppointExists(address.addr()));
        }
        let id = self.watchpoints.allocate_id();
        let watchpoint = Watchpoint::new(id, address, mode, size)?;
        Ok(self.watchpoints.push(watchpoint))
    }

    pub fn enable_watchpoint(&mut self, id: StoppointId) -> Result<()> {
        let watchpoint = self.watchpoints.get_by_id(id)?;
        if watchpoint.is_enabled() {
            return Ok(());
        }
        let (address, mode, size) = (
            watchpoint.address(),
            watchpoint.mode(),
            watchpoint.size(),
        );

        let index = self.set_hardware_stoppoint(address, mode, size)?;
        let watchpoint = self.watchpoints.get_by_id_mut(id)?;
        watchpoint.hardware_index = Some(index);
        watchpoint.set_enabled(true);
        // seed the data history so the first trigger has a baseline
        self.update_watchpoint_data(id)
    }

    pub fn disable_watchpoint(&mut self, id: StoppointId) -> Result<()> {
        let watchpoint = self.watchpoints.get_by_id(id)?;
        if !watchpoint.is_enabled() {
            return Ok(());
        }
        if let Some(index) = watchpoint.hardware_index {
            self.clear_hardware_stoppoint(index)?;
        }
        let watchpoint = self.watchpoints.get_by_id_mut(id)?;
        watchpoint.hardware_index = None;
        watchpoint.set_enabled(false);
        Ok(())
    }

    pub fn remove_watchpoint(&mut self, id: StoppointId) -> Result<()> {
        self.disable_watchpoint(id)?;
        self.watchpoints.remove_by_id(id);
        Ok(())
    }

    fn update_watchpoint_data(&mut self, id: StoppointId) -> Result<()> {
        let watchpoint = self.watchpoints.get_by_id(id)?;
        let (address, size) = (watchpoint.address(), watchpoint.size());

        let bytes = self.read_memory(address, size)?;
        let mut word = [0u8; 8];
        word[..bytes.len().min(8)].copy_from_slice(&bytes[..bytes.len().min(8)]);

        self.watchpoints
            .get_by_id_mut(id)?
            .push_data(u64::from_le_bytes(word));
        Ok(())
    }

    fn encode_hardware_stoppoint_mode(mode: StoppointMode) -> u64 {
        match mode {
            StoppointMode::Write => 0b01,
            StoppointMode::ReadWrite => 0b11,
            StoppointMode::Execute => 0b00,
        }
    }

    fn encode_hardware_stoppoint_size(size: usize) -> Result<u64> {
        match size {
            1 => Ok(0b00),
            2 => Ok(0b01),
            4 => Ok(0b11),
            8 => Ok(0b10),
            other => Err(DebuggerError::InvalidStoppointSize(other)),
        }
    }

    fn find_free_stoppoint_register(control: u64) -> Result<usize> {
        for i in 0..4 {
            // two enable bits per DR; zero means the slot is free
            if control & (0b11 << (i * 2)) == 0 {
                return Ok(i);
            }
        }
        Err(DebuggerError::NoFreeDebugRegister)
    }

    /// Programs a free debug address register with `address` and encodes
    /// mode and size into DR7. Returns the chosen slot.
    fn set_hardware_stoppoint(
        &mut self,
        address: VirtAddr,
        mode: StoppointMode,
        size: usize,
    ) -> Result<usize> {
        let control = self.registers.read_as_u64(RegisterId::dr7);
        let index = Self::find_free_stoppoint_register(control)?;
        trace!("hardware stoppoint at {address} in slot {index}");

        self.write_register_by_id(DR_IDS[index], RegisterValue::U64(address.addr()))?;

        let mode_flag = Self::encode_hardware_stoppoint_mode(mode);
        let size_flag = Self::encode_hardware_stoppoint_size(size)?;

        let enable_bit = 1u64 << (index * 2);
        let mode_bits = mode_flag << (index * 4 + 16);
        let size_bits = size_flag << (index * 4 + 18);
        let clear_mask = (0b11u64 << (index * 2)) | (0b1111u64 << (index * 4 + 16));

        let masked = (control & !clear_mask) | enable_bit | mode_bits | size_bits;
        self.write_register_by_id(RegisterId::dr7, RegisterValue::U64(masked))?;
        Ok(index)
    }

    /// Releases a debug register slot: zeroes the address register and
    /// clears the slot's enable, mode, and size bits in DR7.
    fn clear_hardware_stoppoint(&mut self, index: usize) -> Result<()> {
        self.write_register_by_id(DR_IDS[index], RegisterValue::U64(0))?;
        let control = self.registers.read_as_u64(RegisterId::dr7);
        // each slot owns two enable bits plus four mode/size bits
        let clear_mask = (0b11u64 << (index * 2)) | (0b1111u64 << (index * 4 + 16));
        self.write_register_by_id(RegisterId::dr7, RegisterValue::U64(control & !clear_mask))
    }

    /// Identifies the hardware stoppoint DR6 reports as triggered: the
    /// lowest set status bit names the slot, and the address in that slot is
    /// looked up in the breakpoint and watchpoint collections.
    pub fn get_current_hardware_stoppoint(&self) -> Result<HardwareStoppoint> {
        let status = self.registers.read_as_u64(RegisterId::dr6);
        if status & 0b1111 == 0 {
            return Err(DebuggerError::NoTriggeredStoppoint);
        }
        let index = status.trailing_zeros() as usize;
        let address = VirtAddr::new(self.registers.read_as_u64(DR_IDS[index]));

        if self.breakpoint_sites.contains_address(address) {
            let id = self.breakpoint_sites.get_by_address(address)?.id();
            Ok(HardwareStoppoint::Breakpoint(id))
        } else {
            let id = self.watchpoints.get_by_address(address)?.id();
            Ok(HardwareStoppoint::Watchpoint(id))
        }
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        if self.pid.as_raw() == 0 {
            return;
        }
        if self.is_attached {
            // detaching requires a stopped inferior
            if self.state == ProcessState::Running {
                let _ = kill(self.pid, Signal::SIGSTOP);
                let _ = waitpid(self.pid, None);
            }
            let _ = ptrace::detach(self.pid, None);
            let _ = kill(self.pid, Signal::SIGCONT);
        }
        if self.terminate_on_end {
            let _ = kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launch(program: &str) -> Process {
        Process::launch(program, true, None).unwrap()
    }

    #[test]
    fn launch_succeeds_and_stops() {
        let process = launch("yes");
        assert!(process.exists());
        assert_eq!(process.state(), ProcessState::Stopped);
        assert_eq!(process_state(process.pid()).unwrap(), 't');
    }

    #[test]
    fn launch_reports_exec_failure() {
        let result = Process::launch("you_do_not_have_to_be_good", true, None);
        assert!(matches!(result, Err(DebuggerError::Launch(_))));
    }

    #[test]
    fn resume_runs_to_exit() {
        let mut process = launch("true");
        process.resume().unwrap();
        let reason = process.wait_on_signal().unwrap();
        assert_eq!(reason.state, ProcessState::Exited);
        assert_eq!(reason.info, 0);
        assert!(matches!(
            process.resume(),
            Err(DebuggerError::ResumeAfterTerminal)
        ));
    }

    #[test]
    fn stdout_replacement_redirects_output() {
        let (read_fd, write_fd) = nix::unistd::pipe().unwrap();
        let mut process = Process::launch("pwd", true, Some(write_fd)).unwrap();
        process.resume().unwrap();
        let reason = process.wait_on_signal().unwrap();
        assert_eq!(reason.state, ProcessState::Exited);

        let mut buf = [0u8; 256];
        let n = nix::unistd::read(read_fd.as_raw_fd(), &mut buf).unwrap();
        assert!(n > 0);
        assert!(buf[..n].ends_with(b"\n"));
    }

    #[test]
    fn register_write_round_trips() {
        let mut process = launch("true");
        process
            .write_register_by_id(RegisterId::r13, RegisterValue::U64(0xcafe_cafe))
            .unwrap();
        // refresh the snapshot from the inferior and read the value back
        process.read_all_registers().unwrap();
        assert_eq!(process.registers().read_as_u64(RegisterId::r13), 0xcafe_cafe);
    }

    #[test]
    fn memory_round_trips() {
        let process = launch("true");
        let entry = process.entry_point().unwrap();

        process.write_memory(entry, b"Hello, dbg!\0").unwrap();
        let read = process.read_memory(entry, 12).unwrap();
        assert_eq!(&read, b"Hello, dbg!\0");

        // a sub-word write leaves the following bytes intact
        process.write_memory(entry, b"Bye").unwrap();
        let read = process.read_memory(entry, 12).unwrap();
        assert_eq!(&read, b"Byelo, dbg!\0");
    }

    #[test]
    fn software_breakpoint_stops_at_entry() {
        let mut process = launch("true");
        let entry = process.entry_point().unwrap();

        let id = process.create_breakpoint_site(entry, false, false).unwrap().id();
        process.enable_breakpoint_site(id).unwrap();

        process.resume().unwrap();
        let reason = process.wait_on_signal().unwrap();
        assert_eq!(reason.state, ProcessState::Stopped);
        assert_eq!(reason.info, SIGTRAP_INFO);
        assert_eq!(reason.trap, Some(TrapType::SoftwareBreakpoint));
        assert_eq!(process.get_pc(), entry);

        process.remove_breakpoint_site(id).unwrap();
        process.resume().unwrap();
        let reason = process.wait_on_signal().unwrap();
        assert_eq!(reason.state, ProcessState::Exited);
        assert_eq!(reason.info, 0);
    }

    #[test]
    fn breakpoint_site_is_invisible_to_patched_reads() {
        let mut process = launch("true");
        let entry = process.entry_point().unwrap();
        let original = process.read_memory(entry, 4).unwrap();

        let id = process.create_breakpoint_site(entry, false, false).unwrap().id();
        process.enable_breakpoint_site(id).unwrap();

        let raw = process.read_memory(entry, 4).unwrap();
        assert_eq!(raw[0], INT3);
        let patched = process.read_memory_without_traps(entry, 4).unwrap();
        assert_eq!(patched, original);

        // disabling restores the original byte
        process.disable_breakpoint_site(id).unwrap();
        assert_eq!(process.read_memory(entry, 4).unwrap(), original);
    }

    #[test]
    fn step_at_breakpoint_leaves_site_enabled() {
        let mut process = launch("true");
        let entry = process.entry_point().unwrap();
        let id = process.create_breakpoint_site(entry, false, false).unwrap().id();
        process.enable_breakpoint_site(id).unwrap();

        process.resume().unwrap();
        process.wait_on_signal().unwrap();
        assert_eq!(process.get_pc(), entry);

        let reason = process.step_instruction().unwrap();
        assert_eq!(reason.trap, Some(TrapType::SingleStep));
        assert_ne!(process.get_pc(), entry);
        assert!(process.breakpoint_sites().get_by_id(id).unwrap().is_enabled());
    }

    #[test]
    fn hardware_breakpoint_stops_at_entry() {
        let mut process = launch("true");
        let entry = process.entry_point().unwrap();

        let id = process.create_breakpoint_site(entry, true, false).unwrap().id();
        process.enable_breakpoint_site(id).unwrap();

        process.resume().unwrap();
        let reason = process.wait_on_signal().unwrap();
        assert_eq!(reason.state, ProcessState::Stopped);
        assert_eq!(reason.trap, Some(TrapType::HardwareBreakpoint));
        assert_eq!(process.get_pc(), entry);
        assert_eq!(
            process.get_current_hardware_stoppoint().unwrap(),
            HardwareStoppoint::Breakpoint(id)
        );

        // memory carries no int3 patch
        let byte = process.read_memory(entry, 1).unwrap();
        assert_ne!(byte[0], INT3);
    }

    #[test]
    fn dr7_encoding_tracks_slots() {
        let mut process = launch("true");
        let entry = process.entry_point().unwrap();

        let bp = process.create_breakpoint_site(entry, true, false).unwrap().id();
        process.enable_breakpoint_site(bp).unwrap();
        let wp = process
            .create_watchpoint(VirtAddr::new(entry.addr() & !7), StoppointMode::Write, 8)
            .unwrap()
            .id();
        process.enable_watchpoint(wp).unwrap();

        let control = process.registers().read_as_u64(RegisterId::dr7);
        // slot 0: execute mode, size 1 -> all four mode/size bits clear
        assert_eq!(control & 0b11, 0b01);
        assert_eq!((control >> 16) & 0b1111, 0b0000);
        // slot 1: write mode (0b01), size 8 (0b10)
        assert_eq!((control >> 2) & 0b11, 0b01);
        assert_eq!((control >> 20) & 0b1111, 0b1001);

        process.disable_watchpoint(wp).unwrap();
        let control = process.registers().read_as_u64(RegisterId::dr7);
        assert_eq!((control >> 2) & 0b11, 0b00);
        assert_eq!((control >> 20) & 0b1111, 0b0000);
        assert_eq!(process.registers().read_as_u64(RegisterId::dr1), 0);
    }

    #[test]
    fn debug_registers_exhaust_after_four() {
        let mut process = launch("true");
        let entry = process.entry_point().unwrap();

        for i in 0..4u64 {
            let id = process
                .create_breakpoint_site(entry + 8 * i, true, false)
                .unwrap()
                .id();
            process.enable_breakpoint_site(id).unwrap();
        }
        let id = process
            .create_breakpoint_site(entry + 64, true, false)
            .unwrap()
            .id();
        assert!(matches!(
            process.enable_breakpoint_site(id),
            Err(DebuggerError::NoFreeDebugRegister)
        ));
    }

    #[test]
    fn duplicate_stoppoints_are_rejected() {
        let mut process = launch("true");
        let entry = process.entry_point().unwrap();
        process.create_breakpoint_site(entry, false, false).unwrap();
        assert!(matches!(
            process.create_breakpoint_site(entry, false, false),
            Err(DebuggerError::StoppointExists(_))
        ));
    }

    #[test]
    fn syscall_catch_all_reports_entry_and_exit() {
        let mut process = launch("true");
        process.set_syscall_catch_policy(SyscallCatchPolicy::All);

        process.resume().unwrap();
        let entry_stop = process.wait_on_signal().unwrap();
        assert_eq!(entry_stop.trap, Some(TrapType::Syscall));
        let entry_info = entry_stop.syscall.unwrap();
        assert!(entry_info.entry);
        assert!(matches!(entry_info.data, SyscallData::Args(_)));

        process.resume().unwrap();
        let exit_stop = process.wait_on_signal().unwrap();
        let exit_info = exit_stop.syscall.unwrap();
        assert!(!exit_info.entry);
        assert_eq!(exit_info.id, entry_info.id);
        assert!(matches!(exit_info.data, SyscallData::ReturnValue(_)));
    }

    #[test]
    fn syscall_catch_some_filters_other_syscalls() {
        const EXIT_GROUP: u16 = 231;
        let mut process = launch("true");
        process.set_syscall_catch_policy(SyscallCatchPolicy::Some(vec![EXIT_GROUP]));

        process.resume().unwrap();
        let reason = process.wait_on_signal().unwrap();
        assert_eq!(reason.trap, Some(TrapType::Syscall));
        let info = reason.syscall.unwrap();
        assert_eq!(info.id, EXIT_GROUP);
        assert!(info.entry);

        // exit_group never returns; the next event is process exit
        process.resume().unwrap();
        let reason = process.wait_on_signal().unwrap();
        assert_eq!(reason.state, ProcessState::Exited);
    }
}
