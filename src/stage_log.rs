use std::cell::Cell;

thread_local! {
    static STAGE: Cell<(u32, u32)> = Cell::new((0, 0));
}

#[inline]
pub fn set_stage(stage: u32, iter: u32) {
    STAGE.with(|r| r.set((stage, iter)));
}

#[inline]
pub fn stage() -> (u32, u32) {
    STAGE.with(|r| r.get())
}

#[macro_export]
macro_rules! stage_debug {
    ($t: tt, $($arg:tt)*) => (
        log::debug!(std::concat!("stage-{}.{}: ", $t), $crate::stage_log::stage().0, $crate::stage_log::stage().1, $($arg)*)
    )
}

#[macro_export]
macro_rules! stage_info {
    ($t: tt, $($arg:tt)*) => (
        log::info!(std::concat!("stage-{}.{}: ", $t), $crate::stage_log::stage().0, $crate::stage_log::stage().1, $($arg)*)
    )
}

#[macro_export]
macro_rules! stage_warn {
    ($t: tt, $($arg:tt)*) => (
        log::warn!(std::concat!("stage-{}.{}: ", $t), $crate::stage_log::stage().0, $crate::stage_log::stage().1, $($arg)*)
    )
}
