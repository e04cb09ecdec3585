//! Process creation, teardown and blocking.
//!
//! `process_execute` builds a new process from an executable image and
//! IRETs into it; `process_halt` hands the exit status back to the parent
//! and leaves the actual teardown to the scheduler, which must never free
//! the kernel stack it is running on.

use alloc::vec::Vec;
use core::alloc::Layout;

use crate::{
    error::{KernelError, KernelResult},
    fs,
    mm::{
        frame_allocator, paging, PageFlags, PageMapping, KERNEL_STACK_SIZE, LARGE_PAGE_SIZE,
    },
    sync,
};

use super::{
    pcb::{BlockingCall, FileEntry, FileKind, KernelContext, ProcessState, PID_UNUSED},
    table::{current_pid, table_guard, with_table, ProcessTable},
    Pid, ELF_MAGIC, ENTRYPOINT_OFFSET, EXECUTABLE_PAGE_OFFSET, EXECUTABLE_VIRT_ADDR,
    MAX_ARGS_LEN,
};

/// Split a shell command into the executable name and its argument
/// string. Returns `None` for an empty command.
pub fn parse_command(command: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
    let command = &command[..command.iter().position(|&b| b == 0).unwrap_or(command.len())];

    let name_end = command
        .iter()
        .position(|&b| b == b' ')
        .unwrap_or(command.len());
    let name = &command[..name_end.min(fs::MAX_FILENAME_LEN)];
    if name.is_empty() {
        return None;
    }

    // Skip the separating run of spaces; the rest is the argument string.
    let mut arg_start = name_end;
    while arg_start < command.len() && command[arg_start] == b' ' {
        arg_start += 1;
    }
    let args = &command[arg_start..command.len().min(arg_start + MAX_ARGS_LEN - 1)];

    Some((name.to_vec(), args.to_vec()))
}

/// Allocate an 8 KiB, 8 KiB-aligned kernel stack and stamp the owning PID
/// into its topmost word. Returns the stack top (highest address).
fn allocate_kernel_stack(pid: Pid) -> Option<usize> {
    let layout =
        Layout::from_size_align(KERNEL_STACK_SIZE as usize, KERNEL_STACK_SIZE as usize).ok()?;
    // SAFETY: layout has non-zero size.
    let ptr = unsafe { alloc::alloc::alloc(layout) };
    if ptr.is_null() {
        return None;
    }

    let top = ptr as usize + KERNEL_STACK_SIZE as usize;
    // SAFETY: the word just below the top lies inside the allocation.
    unsafe {
        *((top - 4) as *mut Pid) = pid;
    }
    Some(top)
}

fn free_kernel_stack(top: usize) {
    if top == 0 {
        return;
    }
    let layout =
        Layout::from_size_align(KERNEL_STACK_SIZE as usize, KERNEL_STACK_SIZE as usize)
            .expect("kernel stack layout");
    // SAFETY: `top` came from allocate_kernel_stack, so top - size is the
    // pointer the allocator handed out.
    unsafe {
        alloc::alloc::dealloc((top - KERNEL_STACK_SIZE as usize) as *mut u8, layout);
    }
}

/// Map in every page owned by `pid`, including its video-memory window.
pub fn map_process(table: &ProcessTable, pid: Pid) -> KernelResult<()> {
    let pcb = table.pcb(pid).ok_or(KernelError::ProcessNotFound { pid })?;

    for mapping in &pcb.large_page_mappings {
        // Clear the slot first; map_region refuses to overwrite.
        paging::unmap_region(mapping.virt_addr(), 1);
        paging::map_region(
            mapping.phys_addr(),
            mapping.virt_addr(),
            1,
            PageFlags::READ_WRITE | PageFlags::USER,
        )?;
    }

    if pcb.vid_mem.is_some() {
        // Route the window at the live framebuffer or the TTY's
        // back-buffer depending on which TTY is active.
        let phys = crate::tty::vid_mem_phys(pcb.tty);
        paging::map_video_mem_user(phys, crate::graphics::framebuffer().size_bytes());
    }

    Ok(())
}

/// Unmap every page owned by `pid`, including its video-memory window.
pub fn unmap_process(table: &ProcessTable, pid: Pid) -> KernelResult<()> {
    let pcb = table.pcb(pid).ok_or(KernelError::ProcessNotFound { pid })?;

    for mapping in &pcb.large_page_mappings {
        paging::unmap_region(mapping.virt_addr(), 1);
    }

    if pcb.vid_mem.is_some() {
        paging::unmap_video_mem_user();
    }

    Ok(())
}

/// Free every resource held by `pid` and release its table slot.
///
/// Must not be called for the process whose kernel stack is currently
/// executing, except on the root-shell respawn path where interrupts stay
/// masked until the replacement shell is entered.
pub fn free_pid(table: &mut ProcessTable, pid: Pid) {
    let Some(pcb) = table.pcb_mut(pid) else {
        return;
    };

    let kinds: Vec<FileKind> = pcb
        .files
        .iter()
        .filter(|f| f.in_use)
        .map(|f| f.kind)
        .collect();
    let tty = pcb.tty;
    let stack_top = pcb.kernel_stack_base;
    let mappings = core::mem::take(&mut pcb.large_page_mappings);
    pcb.files.clear();
    pcb.kernel_stack_base = 0;

    for kind in kinds {
        crate::syscall::files::close_hook(kind, tty);
    }

    for mapping in mappings {
        frame_allocator::free_page(mapping.phys_index);
    }

    free_kernel_stack(stack_top);

    table.release_slot(pid);
}

/// Read the image into the mapped user page and extract the entrypoint.
#[cfg(all(target_arch = "x86", target_os = "none"))]
fn load_executable_image(name: &[u8]) -> KernelResult<u32> {
    let load_addr = EXECUTABLE_VIRT_ADDR + EXECUTABLE_PAGE_OFFSET;
    // SAFETY: the image page was just mapped read-write at
    // EXECUTABLE_VIRT_ADDR and the window stays inside it.
    let window = unsafe {
        core::slice::from_raw_parts_mut(
            load_addr as *mut u8,
            (LARGE_PAGE_SIZE - EXECUTABLE_PAGE_OFFSET) as usize,
        )
    };
    fs::load_image(name, window)?;
    parse_image_header(window)
}

/// Host rendition: loads into a scratch buffer since no user page exists.
#[cfg(not(all(target_arch = "x86", target_os = "none")))]
fn load_executable_image(name: &[u8]) -> KernelResult<u32> {
    let mut window = alloc::vec![0u8; (LARGE_PAGE_SIZE - EXECUTABLE_PAGE_OFFSET) as usize];
    fs::load_image(name, &mut window)?;
    parse_image_header(&window)
}

/// Validate the 4-byte magic and read the entrypoint at its fixed offset.
fn parse_image_header(image: &[u8]) -> KernelResult<u32> {
    if image.len() < ENTRYPOINT_OFFSET + 4 {
        return Err(KernelError::InvalidArgument {
            name: "image",
            value: "truncated",
        });
    }

    let magic = u32::from_le_bytes([image[0], image[1], image[2], image[3]]);
    if magic != ELF_MAGIC {
        return Err(KernelError::InvalidArgument {
            name: "image",
            value: "bad_magic",
        });
    }

    Ok(u32::from_le_bytes([
        image[ENTRYPOINT_OFFSET],
        image[ENTRYPOINT_OFFSET + 1],
        image[ENTRYPOINT_OFFSET + 2],
        image[ENTRYPOINT_OFFSET + 3],
    ]))
}

/// Start the process for a shell command.
///
/// * `has_parent` — the caller becomes the parent and sleeps until the
///   child halts.
/// * `tty` — the TTY for a parentless process (a root shell).
/// * `save_context` — record a resume point in the calling process's PCB
///   so execution returns here when the new process yields the CPU back.
///
/// Returns the child's halt status, or -1 if the launch failed.
pub fn process_execute(command: &[u8], has_parent: bool, tty: u8, save_context: bool) -> i32 {
    let Some((name, args)) = parse_command(command) else {
        return -1;
    };

    let cur_pid = with_table(|t| t.get_open_pid());

    // Interrupts stay masked from here until the IRET enables them in the
    // new process (or until the failure path returns).
    let flags = sync::irq_save();
    let mut table = table_guard();

    let caller_pid = current_pid();
    let parent_pid = if has_parent { caller_pid } else { PID_UNUSED };
    let parent_tty = if has_parent {
        table.pcb(caller_pid).map(|p| p.tty).unwrap_or(tty)
    } else {
        tty
    };

    if has_parent {
        if let Some(parent) = table.pcb_mut(caller_pid) {
            parent.state = ProcessState::Sleeping;
            parent.blocking_call = BlockingCall::ProcessExec { child_status: 0 };
        }
    }

    let setup = 'setup: {
        let Some(page_index) = frame_allocator::get_open_page() else {
            break 'setup Err(None);
        };

        // Page out the caller so the image page can be written, then map
        // the child's single 4 MiB page.
        if has_parent || save_context {
            let _ = unmap_process(&table, caller_pid);
        }
        if paging::map_region(
            page_index * LARGE_PAGE_SIZE,
            EXECUTABLE_VIRT_ADDR,
            1,
            PageFlags::READ_WRITE | PageFlags::USER,
        )
        .is_err()
        {
            break 'setup Err(Some((page_index, 0)));
        }

        let entrypoint = match load_executable_image(&name) {
            Ok(e) => e,
            Err(_) => break 'setup Err(Some((page_index, 0))),
        };

        let Some(kernel_stack_base) = allocate_kernel_stack(cur_pid) else {
            break 'setup Err(Some((page_index, 0)));
        };

        Ok((page_index, entrypoint, kernel_stack_base))
    };

    let (page_index, entrypoint, kernel_stack_base) = match setup {
        Ok(v) => v,
        Err(allocated) => {
            // Roll the partial work back and resume the caller.
            if let Some((page_index, stack)) = allocated {
                paging::unmap_region(EXECUTABLE_VIRT_ADDR, 1);
                frame_allocator::free_page(page_index);
                free_kernel_stack(stack);
            }
            if has_parent || save_context {
                let _ = map_process(&table, caller_pid);
            }
            if let Some(parent) = table.pcb_mut(caller_pid) {
                parent.state = ProcessState::Running;
                parent.blocking_call = BlockingCall::None;
            }
            table.release_slot(cur_pid);
            drop(table);
            sync::irq_restore(flags);
            return -1;
        }
    };

    crate::arch::set_tss_ss0(crate::arch::KERNEL_DS);
    crate::arch::set_tss_esp0(kernel_stack_base as u32 - 4);

    {
        let pcb = table.pcb_mut(cur_pid).expect("slot reserved above");
        pcb.parent_pid = parent_pid;
        pcb.tty = parent_tty;
        pcb.state = ProcessState::Running;
        pcb.vid_mem = None;
        pcb.kernel_stack_base = kernel_stack_base;
        pcb.context = KernelContext::default();
        pcb.signal_handlers = [None; crate::signal::NUM_SIGNALS];
        pcb.signal_status = [crate::signal::SignalStatus::Open; crate::signal::NUM_SIGNALS];
        pcb.signal_data = [0; crate::signal::NUM_SIGNALS];
        pcb.blocking_call = BlockingCall::None;
        pcb.files = alloc::vec![
            FileEntry::new(FileKind::Stdin),
            FileEntry::new(FileKind::Stdout),
        ];
        pcb.large_page_mappings = alloc::vec![PageMapping::new(
            EXECUTABLE_VIRT_ADDR / LARGE_PAGE_SIZE,
            page_index,
        )];
        pcb.set_args(&args);
    }

    log::debug!("starting pid {} ({})", cur_pid, name.escape_ascii());

    crate::arch::set_in_userspace(true);

    // User stack starts at the top of the image page.
    let user_esp = EXECUTABLE_VIRT_ADDR + LARGE_PAGE_SIZE - 1;

    let save_ptr: Option<*mut KernelContext> = if save_context {
        table
            .pcb_mut(caller_pid)
            .map(|p| &mut p.context as *mut KernelContext)
    } else {
        None
    };

    drop(table);

    // SAFETY: the image page is mapped user-accessible with a validated
    // entrypoint, TSS esp0 points at the child's fresh kernel stack, and
    // interrupts are masked until the IRET's pushed EFLAGS re-enable
    // them. When `save_ptr` is set, the saved resume point brings control
    // back to the instruction after this call.
    unsafe {
        crate::arch::enter_user(entrypoint, user_esp, save_ptr);
    }

    // Only reached through the saved resume point: the child halted (or a
    // TTY-switch shell yielded the CPU back).
    sync::irq_restore(flags);

    with_table(|t| match t.pcb(current_pid()) {
        Some(pcb) => match pcb.blocking_call {
            BlockingCall::ProcessExec { child_status } => child_status as i32,
            _ => 0,
        },
        None => 0,
    })
}

/// Bookkeeping half of `process_halt`: wake the parent with the status,
/// or, for a root shell, tear the process down and report which TTY needs
/// a replacement shell.
pub fn halt_bookkeeping(table: &mut ProcessTable, pid: Pid, status: u16) -> Option<u8> {
    let (parent_pid, tty) = match table.pcb(pid) {
        Some(pcb) => (pcb.parent_pid, pcb.tty),
        None => return None,
    };

    if parent_pid < 0 {
        // Root shell: free everything (including the stack we are running
        // on; interrupts are masked until the new shell is entered) and
        // respawn in the same TTY.
        let _ = unmap_process(table, pid);
        free_pid(table, pid);
        return Some(tty);
    }

    if let Some(parent) = table.pcb_mut(parent_pid) {
        parent.state = ProcessState::Running;
        parent.blocking_call = BlockingCall::ProcessExec {
            child_status: status,
        };
    }
    if let Some(pcb) = table.pcb_mut(pid) {
        pcb.state = ProcessState::Stopping;
    }
    None
}

/// Halt the current process with `status`. Does not return to the caller;
/// the scheduler reaps the PCB and resumes the parent.
pub fn process_halt(status: u16) -> i32 {
    let pid = current_pid();

    let respawn_tty = with_table(|t| halt_bookkeeping(t, pid, status));

    if let Some(tty) = respawn_tty {
        process_execute(b"shell", false, tty, false);
    }

    // Spin with interrupts enabled until the scheduler switches away for
    // good.
    crate::arch::enable_interrupts();
    loop {
        core::hint::spin_loop();
    }
}

/// Mark `pid` sleeping and spin (interrupts enabled between checks) until
/// the scheduler returns here with the process runnable again.
pub fn process_sleep(pid: Pid) {
    with_table(|t| {
        if let Some(pcb) = t.pcb_mut(pid) {
            pcb.state = ProcessState::Sleeping;
        }
    });

    crate::arch::enable_interrupts();
    loop {
        let sleeping = with_table(|t| {
            t.pcb(pid)
                .map(|p| p.state == ProcessState::Sleeping)
                .unwrap_or(false)
        });
        if !sleeping {
            break;
        }
        core::hint::spin_loop();
    }
}

/// Make `pid` runnable again.
pub fn process_wake(pid: Pid) {
    with_table(|t| {
        if let Some(pcb) = t.pcb_mut(pid) {
            pcb.state = ProcessState::Running;
        }
    });
}
