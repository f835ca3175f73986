//! The render worker.
//!
//! One iteration: pick the earliest ready picture, drop it if late, wait
//! another round if too early, otherwise composite it into the off-screen
//! back buffer, sleep until its display deadline, present, flip, and run
//! the management pass.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use common::{Rect, SampleAspect, TICK_INVALID, Tick, tick_is_valid};

use super::convert::{self, BackPixel, DstSpan};
use super::heap::ReadyPicture;
use super::{
    CHANGE_GAMMA, CHANGE_GRAYSCALE, Shared, VOUT_DISPLAY_DELAY, VOUT_IDLE_SLEEP, VoutState,
};
use crate::clock;

const STATS_BAND_HEIGHT: u32 = 8;
const INTERFACE_BAND_HEIGHT: u32 = 16;
const BAND_FILL: u8 = 0x33;

pub(super) fn run(shared: Arc<Shared>) {
    log::debug!("video output worker running");
    while !shared.die.load(Ordering::Acquire) {
        iteration(&shared);
    }
    log::debug!("video output worker exiting");
}

fn iteration(shared: &Shared) {
    let current = clock::now();

    let mut selected: Option<ReadyPicture> = None;
    let mut display_date = TICK_INVALID;

    {
        let mut state = shared.state.lock().unwrap();

        // Readiness is a terminal transition, so the scan itself needs no
        // coordination with producers beyond the heap's own lock.
        if let Some(pic) = shared.heap.earliest_ready() {
            let stepping = state.paused && state.step_requests > 0;
            if state.paused && !stepping {
                // Frozen: leave the picture queued.
            } else if pic.force || stepping {
                if stepping {
                    state.step_requests -= 1;
                }
                display_date = current;
                selected = Some(pic);
            } else if pic.date < current {
                if shared.heap.consume(pic.index) {
                    shared.lost.fetch_add(1, Ordering::AcqRel);
                    log::warn!("late picture skipped ({} us)", current - pic.date);
                }
            } else if pic.date > current + VOUT_DISPLAY_DELAY {
                // Too early; check again next iteration.
            } else {
                display_date = pic.date;
                selected = Some(pic);
            }
        }

        if let Some(pic) = &selected {
            let state = &mut *state;
            render_frame(state, shared, pic, display_date);
            state.last_picture_date = pic.date;
            // The slot leaves the heap as soon as it is composited, before
            // the lock is dropped for the sleep, so producers regain its
            // capacity during the display wait.
            if shared.heap.consume(pic.index) {
                shared.displayed.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    // The change lock is released across the sleep.
    if selected.is_some() {
        clock::wait_until(display_date);
    } else {
        clock::wait_until(current + VOUT_IDLE_SLEEP);
    }

    let mut state = shared.state.lock().unwrap();
    let state = &mut *state;
    if selected.is_some() {
        let buffer = &state.buffers[state.buffer_index];
        state
            .backend
            .present(buffer.data(), buffer.width(), buffer.height());
        state.buffer_index ^= 1;
    }
    manage(shared, state, clock::now());
}

fn render_frame(state: &mut VoutState, shared: &Shared, pic: &ReadyPicture, date: Tick) {
    let index = state.buffer_index;
    let (out_w, out_h) = (state.buffers[index].width(), state.buffers[index].height());
    let rect = picture_box(
        out_w,
        out_h,
        pic.layout.width,
        pic.layout.height,
        pic.aspect,
        state.scale,
    );

    {
        let buffer = &mut state.buffers[index];
        buffer.set_picture_rect(rect);
        buffer.clear();
        buffer.reset_areas();
    }

    {
        let src = pic.buffer.read().unwrap();
        let converter = convert::converter_for(pic.layout.pixel);
        let bytes_per_line = state.buffers[index].bytes_per_line();
        converter(
            &pic.layout,
            &src,
            &state.tables,
            DstSpan {
                data: state.buffers[index].data_mut(),
                bytes_per_line,
                rect,
            },
        );
    }

    overlay_subpictures(state, shared, index, date);
    if state.show_stats {
        overlay_stats(state, shared, index);
    }
    if state.show_interface {
        overlay_interface(state, index);
    }
}

/// Fit the picture into the output, preferring horizontal fill. Widths are
/// rounded down to a multiple of 16 and the box is centred.
fn picture_box(
    out_w: u32,
    out_h: u32,
    src_w: u32,
    src_h: u32,
    aspect: SampleAspect,
    scale: bool,
) -> Rect {
    if out_w == 0 || out_h == 0 || src_w == 0 || src_h == 0 {
        return Rect::default();
    }

    let mut width = if scale || src_w > out_w { out_w } else { src_w };
    width = (width / 16) * 16;
    if width == 0 {
        width = out_w.min(src_w);
    }
    let mut height = height_for(aspect, width, src_w, src_h).max(1);

    if height > out_h {
        height = if scale || src_h > out_h { out_h } else { src_h };
        width = width_for(aspect, height, src_w, src_h);
        width = (width / 16) * 16;
        if width == 0 {
            width = out_w.min(src_w);
        }
    }
    width = width.min(out_w);
    height = height.min(out_h);

    Rect {
        x: (out_w - width) / 2,
        y: (out_h - height) / 2,
        width,
        height,
    }
}

fn height_for(aspect: SampleAspect, width: u32, src_w: u32, src_h: u32) -> u32 {
    match aspect {
        SampleAspect::Ratio4x3 => width * 3 / 4,
        SampleAspect::Ratio16x9 => width * 9 / 16,
        SampleAspect::Ratio221x100 => width * 100 / 221,
        SampleAspect::Square => src_h * width / src_w,
    }
}

fn width_for(aspect: SampleAspect, height: u32, src_w: u32, src_h: u32) -> u32 {
    match aspect {
        SampleAspect::Ratio4x3 => height * 4 / 3,
        SampleAspect::Ratio16x9 => height * 16 / 9,
        SampleAspect::Ratio221x100 => height * 221 / 100,
        SampleAspect::Square => src_w * height / src_h,
    }
}

/// Blit the subtitles visible at `date`, stacked from the bottom edge up,
/// lowest order nearest the edge.
fn overlay_subpictures(state: &mut VoutState, shared: &Shared, index: usize, date: Tick) {
    if !tick_is_valid(date) {
        return;
    }
    let visible = shared.spu.visible_at(date);
    if visible.is_empty() {
        return;
    }

    let buffer = &mut state.buffers[index];
    let width = buffer.width();
    let bytes_per_line = buffer.bytes_per_line();
    let mut base = buffer.height();

    for spu in visible {
        if spu.height == 0 || spu.height > base {
            continue;
        }
        let top = base - spu.height;
        let copy_width = width.min(spu.width) as usize * BackPixel::SIZE;
        let spu_stride = spu.width as usize * BackPixel::SIZE;
        let data = buffer.data_mut();
        for row in 0..spu.height {
            let dst_from = (top + row) as usize * bytes_per_line;
            let src_from = row as usize * spu_stride;
            if src_from + copy_width <= spu.payload.len() {
                data[dst_from..dst_from + copy_width]
                    .copy_from_slice(&spu.payload[src_from..src_from + copy_width]);
            } else {
                data[dst_from..dst_from + bytes_per_line].fill(BAND_FILL);
            }
        }
        buffer.mark(0, top, width, spu.height);
        base = top;
    }
}

/// Fill the statistics band along the top edge. Glyph rendering lives
/// outside the engine; the band carries the counters via the log instead.
fn overlay_stats(state: &mut VoutState, shared: &Shared, index: usize) {
    let buffer = &mut state.buffers[index];
    let width = buffer.width();
    let height = STATS_BAND_HEIGHT.min(buffer.height());
    let bytes_per_line = buffer.bytes_per_line();
    buffer.data_mut()[..height as usize * bytes_per_line].fill(BAND_FILL);
    buffer.mark(0, 0, width, height);

    log::trace!(
        "frame stats: {} displayed, {} lost",
        shared.displayed.load(Ordering::Acquire),
        shared.lost.load(Ordering::Acquire)
    );
}

/// Fill the interface band along the bottom edge.
fn overlay_interface(state: &mut VoutState, index: usize) {
    let buffer = &mut state.buffers[index];
    let width = buffer.width();
    let buffer_height = buffer.height();
    let height = INTERFACE_BAND_HEIGHT.min(buffer_height);
    let top = buffer_height - height;
    let bytes_per_line = buffer.bytes_per_line();
    let from = top as usize * bytes_per_line;
    buffer.data_mut()[from..].fill(BAND_FILL);
    buffer.mark(0, top, width, height);
}

/// Handle deferred configuration changes between frames.
fn manage(shared: &Shared, state: &mut VoutState, now: Tick) {
    shared.spu.expire(now);

    if state.changes & (CHANGE_GAMMA | CHANGE_GRAYSCALE) != 0 {
        let (gamma, grayscale) = (state.gamma, state.grayscale);
        state.tables.rebuild(gamma, grayscale);
        state.changes &= !(CHANGE_GAMMA | CHANGE_GRAYSCALE);
        log::debug!("rebuilt colour tables (gamma {gamma}, grayscale {grayscale})");
    }

    if state.changes != 0 {
        log::error!(
            "unacknowledged video output change flags {:#x}",
            state.changes
        );
        debug_assert!(false, "unacknowledged change flags {:#x}", state.changes);
        state.changes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_picture_box_horizontal_fit() {
        let rect = picture_box(640, 480, 320, 240, SampleAspect::Square, true);
        assert_eq!(rect.width, 640);
        assert_eq!(rect.height, 480);
        assert_eq!(rect.x, 0);
        assert_eq!(rect.y, 0);
    }

    #[test]
    fn test_picture_box_width_multiple_of_16() {
        let rect = picture_box(100, 100, 100, 100, SampleAspect::Square, true);
        assert_eq!(rect.width % 16, 0);
        assert_eq!(rect.width, 96);
    }

    #[test]
    fn test_picture_box_vertical_refit() {
        // 16:9 declared aspect on a portrait output: horizontal fit would
        // overflow vertically, so the box is refit against the height.
        let rect = picture_box(640, 200, 640, 360, SampleAspect::Ratio16x9, true);
        assert!(rect.height <= 200);
        assert!(rect.width <= 640);
        assert_eq!(rect.width % 16, 0);
    }

    #[test]
    fn test_picture_box_centres() {
        let rect = picture_box(640, 480, 320, 240, SampleAspect::Square, false);
        assert_eq!(rect.width, 320);
        assert_eq!(rect.height, 240);
        assert_eq!(rect.x, 160);
        assert_eq!(rect.y, 120);
    }

    #[test]
    fn test_picture_box_aspect_heights() {
        let wide = picture_box(640, 480, 640, 480, SampleAspect::Ratio16x9, true);
        assert_eq!(wide.height, 360);
        let tv = picture_box(640, 480, 640, 480, SampleAspect::Ratio4x3, true);
        assert_eq!(tv.height, 480);
    }
}
