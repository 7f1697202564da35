//! Memory management: the flat paging layout and the per-process window.

pub mod paging;

pub use paging::{
    current_user_frame, init, map_dma_region, map_user_vidmem, switch_to, user_frame_for,
    user_video_addr, user_window, KERNEL_BASE, LARGE_PAGE_SIZE, PAGE_SIZE, USER_ENTRY_OFFSET,
    USER_STACK_TOP, USER_WINDOW_BASE, USER_WINDOW_SIZE,
};
