//! The target facade.
//!
//! A [`Target`] binds one [`Process`] to the [`Elf`] image it was loaded
//! from (and that image's [`Dwarf`]), so address translation between the
//! file and runtime views is available at every boundary. The load bias is
//! computed from the inferior's auxiliary vector: the runtime entry point
//! minus the entry point the image records.

use std::path::{Path, PathBuf};
use std::rc::Rc;

use nix::unistd::Pid;
use std::os::fd::OwnedFd;
use tracing::debug;

use crate::addr::VirtAddr;
use crate::dwarf::Dwarf;
use crate::elf::Elf;
use crate::errors::Result;
use crate::process::Process;

pub struct Target {
    process: Process,
    elf: Rc<Elf>,
    dwarf: Dwarf,
}

impl Target {
    /// Launches the program at `path` under tracing and loads its image.
    pub fn launch(path: impl AsRef<Path>, stdout_replacement: Option<OwnedFd>) -> Result<Self> {
        let path = path.as_ref();
        let process = Process::launch(path, true, stdout_replacement)?;
        let (elf, dwarf) = Self::create_loaded_elf(&process, path)?;
        Ok(Target {
            process,
            elf,
            dwarf,
        })
    }

    /// Attaches to a running process, resolving its image through
    /// `/proc/<pid>/exe`.
    pub fn attach(pid: Pid) -> Result<Self> {
        let elf_path = PathBuf::from(format!("/proc/{pid}/exe"));
        let process = Process::attach(pid)?;
        let (elf, dwarf) = Self::create_loaded_elf(&process, &elf_path)?;
        Ok(Target {
            process,
            elf,
            dwarf,
        })
    }

    fn create_loaded_elf(process: &Process, path: &Path) -> Result<(Rc<Elf>, Dwarf)> {
        let elf = Elf::open(path)?;
        let entry = process.entry_point()?;
        let bias = VirtAddr::new(entry.addr() - elf.entry_point());
        elf.notify_loaded(bias);
        debug!("{} loaded with bias {bias}", path.display());

        let dwarf = Dwarf::new(elf.clone())?;
        Ok((elf, dwarf))
    }

    pub fn process(&self) -> &Process {
        &self.process
    }

    pub fn process_mut(&mut self) -> &mut Process {
        &mut self.process
    }

    pub fn elf(&self) -> &Rc<Elf> {
        &self.elf
    }

    pub fn dwarf(&self) -> &Dwarf {
        &self.dwarf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessState;

    fn true_path() -> &'static str {
        for candidate in ["/usr/bin/true", "/bin/true"] {
            if std::path::Path::new(candidate).exists() {
                return candidate;
            }
        }
        panic!("no `true` binary found");
    }

    #[test]
    fn launch_binds_process_and_image() {
        let target = Target::launch(true_path(), None).unwrap();
        assert_eq!(target.process().state(), ProcessState::Stopped);

        // the image's entry point translates to the runtime entry point
        let runtime_entry = target.process().entry_point().unwrap();
        let file_entry = crate::addr::FileAddr::new(target.elf(), target.elf().entry_point());
        assert_eq!(file_entry.to_virt(), runtime_entry);
        assert_eq!(runtime_entry.to_file_addr(target.elf()), file_entry);
    }

    #[test]
    fn breakpoint_at_translated_entry_hits() {
        let mut target = Target::launch(true_path(), None).unwrap();
        let entry = target.process().entry_point().unwrap();

        let id = target
            .process_mut()
            .create_breakpoint_site(entry, false, false)
            .unwrap()
            .id();
        target.process_mut().enable_breakpoint_site(id).unwrap();
        target.process_mut().resume().unwrap();
        let reason = target.process_mut().wait_on_signal().unwrap();

        assert_eq!(reason.state, ProcessState::Stopped);
        assert_eq!(target.process().get_pc(), entry);
    }
}
