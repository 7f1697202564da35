//! Boot entry: bring the machine up, mount the file-system image the
//! bootloader loaded as a ramdisk, spawn one root shell per terminal,
//! and hand the CPU to the scheduler.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod boot {
    use core::panic::PanicInfo;

    use bootloader_api::{entry_point, BootInfo};
    use cerulean_kernel::{
        arch, drivers, fs, irq, mm, println, process, sched, serial, tty,
    };

    entry_point!(kernel_main);

    fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
        serial::init_logging();
        println!("Cerulean v{}", env!("CARGO_PKG_VERSION"));

        arch::init();
        mm::init();
        irq::init();
        process::init();
        tty::init();

        // The file-system image rides along as the bootloader ramdisk.
        match (boot_info.ramdisk_addr.into_option(), boot_info.ramdisk_len) {
            (Some(addr), len) if len >= fs::BLOCK_SIZE as u64 => {
                // SAFETY: the bootloader mapped the ramdisk at this
                // address for the kernel's lifetime.
                let image =
                    unsafe { core::slice::from_raw_parts(addr as *const u8, len as usize) };
                if fs::init(image).is_err() {
                    panic!("file-system image rejected");
                }
            }
            _ => panic!("no file-system image"),
        }

        drivers::keyboard::init();
        drivers::rtc::init();
        if let Ok(version) = drivers::sb16::init_sound() {
            log::info!("sb16: present, version {:#06x}", version);
        }

        sched::init();
        drivers::pit::init();

        // One non-haltable shell per visible terminal; the scheduler
        // starts them on the next ticks.
        for tid in 0..tty::NUM_TERMINALS {
            sched::schedule_job(b"shell", tid as i32, false).expect("shell slot");
        }

        arch::enable_interrupts();
        arch::halt_loop();
    }

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        arch::disable_interrupts();
        println!("[KERNEL PANIC] {}", info);
        serial::write_fmt(format_args!("[KERNEL PANIC] {}\n", info));
        arch::halt_loop();
    }
}

#[cfg(not(target_os = "none"))]
fn main() {}
