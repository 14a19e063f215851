//! Scanline compositor. Reads the video block and produces one line of
//! `0x00RRGGBB` pixels; it never writes video state.
//!
//! Anything that points outside the memory it should read (tile numbers past
//! the character block, affine coordinates past the map without wraparound,
//! OBJ tiles under the bitmap frame buffer) comes out transparent.

use crate::video::{
    DISPCNT_BG0, DISPCNT_FORCED_BLANK, DISPCNT_FRAME_SELECT, DISPCNT_OBJ, DISPCNT_OBJ_1D,
    DISPCNT_OBJWIN, DISPCNT_WIN0, DISPCNT_WIN1, OBJ_VRAM_TILED, Video,
};

pub const SCREEN_WIDTH: usize = 240;
pub const SCREEN_HEIGHT: usize = 160;

const WHITE: u32 = 0x00FF_FFFF;
/// Marks an empty pixel in the 15-bit layer buffers.
const TRANSPARENT: u16 = 0x8000;

const LAYER_OBJ: usize = 4;
const LAYER_BACKDROP: usize = 5;
const WIN_EFFECTS: u8 = 0x20;

const BITMAP_PAGE: u32 = 0xA000;

/// Width and height in pixels by `[shape][size]`.
const OBJ_DIMENSIONS: [[(i32, i32); 4]; 3] = [
    [(8, 8), (16, 16), (32, 32), (64, 64)],
    [(16, 8), (32, 8), (32, 16), (64, 32)],
    [(8, 16), (8, 32), (16, 32), (32, 64)],
];

#[derive(Clone, Copy)]
struct ObjPixel {
    color: u16,
    priority: u8,
    semi_transparent: bool,
}

const NO_OBJ: ObjPixel = ObjPixel {
    color: TRANSPARENT,
    priority: 4,
    semi_transparent: false,
};

/// Convert a BGR555 color to `0x00RRGGBB`.
#[inline]
pub fn rgb(color: u16) -> u32 {
    let expand = |c: u16| {
        let c = (c & 0x1F) as u32;
        (c << 3) | (c >> 2)
    };
    (expand(color) << 16) | (expand(color >> 5) << 8) | expand(color >> 10)
}

/// Composite scanline `line` into `out` (240 pixels).
pub fn render_line(video: &Video, line: u16, out: &mut [u32]) {
    if video.dispcnt & DISPCNT_FORCED_BLANK != 0 {
        out.fill(WHITE);
        return;
    }

    let mut bgs = [[TRANSPARENT; SCREEN_WIDTH]; 4];
    let enabled = background_layers(video);
    for bg in 0..4 {
        if enabled & (1 << bg) == 0 {
            continue;
        }
        match (video.mode(), bg) {
            (0, _) | (1, 0) | (1, 1) => text_line(video, bg, line, &mut bgs[bg]),
            (1, 2) | (2, 2) | (2, 3) => affine_line(video, bg, &mut bgs[bg]),
            (3..=5, 2) => bitmap_line(video, &mut bgs[bg]),
            _ => {}
        }
    }

    let mut objs = [NO_OBJ; SCREEN_WIDTH];
    let mut obj_window = [false; SCREEN_WIDTH];
    if video.dispcnt & DISPCNT_OBJ != 0 {
        obj_line(video, line, &mut objs, &mut obj_window);
    }

    let backdrop = video.palette_color(0);
    for (x, pixel) in out.iter_mut().enumerate().take(SCREEN_WIDTH) {
        let window = window_control(video, x as u16, line, obj_window[x]);

        // Top two visible layers: (layer id, color).
        let mut top = (LAYER_BACKDROP, backdrop);
        let mut below = (LAYER_BACKDROP, backdrop);
        let mut top_rank = u16::MAX;
        let mut below_rank = u16::MAX;
        let mut consider = |layer: usize, color: u16, rank: u16| {
            if rank < top_rank {
                below = top;
                below_rank = top_rank;
                top = (layer, color);
                top_rank = rank;
            } else if rank < below_rank {
                below = (layer, color);
                below_rank = rank;
            }
        };
        for (bg, layer) in bgs.iter().enumerate() {
            let color = layer[x];
            if color != TRANSPARENT && window & (1 << bg) != 0 {
                let priority = video.bgcnt[bg] & 3;
                consider(bg, color, priority * 8 + 1 + bg as u16);
            }
        }
        let obj = objs[x];
        if obj.color != TRANSPARENT && window & (1 << LAYER_OBJ) != 0 {
            consider(LAYER_OBJ, obj.color, obj.priority as u16 * 8);
        }

        let effects = window & WIN_EFFECTS != 0;
        let color = if effects {
            blend(video, top, below, top.0 == LAYER_OBJ && obj.semi_transparent)
        } else {
            top.1
        };
        *pixel = rgb(color);
    }
}

/// BG enable bits for the current mode (DISPCNT bits 8-11 masked by what
/// the mode can display).
fn background_layers(video: &Video) -> u8 {
    let requested = ((video.dispcnt & (0xF * DISPCNT_BG0)) >> 8) as u8;
    let available = match video.mode() {
        0 => 0b1111,
        1 => 0b0111,
        2 => 0b1100,
        3..=5 => 0b0100,
        _ => 0,
    };
    requested & available
}

/// Layer-enable bits (BG0-3, OBJ, effects) that apply at `(x, line)`.
fn window_control(video: &Video, x: u16, line: u16, in_obj_window: bool) -> u8 {
    let any = DISPCNT_WIN0 | DISPCNT_WIN1 | DISPCNT_OBJWIN;
    if video.dispcnt & any == 0 {
        return 0x3F;
    }
    for (i, flag) in [DISPCNT_WIN0, DISPCNT_WIN1].into_iter().enumerate() {
        if video.dispcnt & flag != 0
            && in_span(video.win_h[i], x, SCREEN_WIDTH as u16)
            && in_span(video.win_v[i], line, SCREEN_HEIGHT as u16)
        {
            return (video.winin >> (8 * i)) as u8 & 0x3F;
        }
    }
    if video.dispcnt & DISPCNT_OBJWIN != 0 && in_obj_window {
        return (video.winout >> 8) as u8 & 0x3F;
    }
    video.winout as u8 & 0x3F
}

/// Window span register: start in the high byte, end (exclusive) in the
/// low byte. An end past the screen or before the start reads as the
/// screen edge.
fn in_span(reg: u16, pos: u16, limit: u16) -> bool {
    let start = reg >> 8;
    let mut end = reg & 0xFF;
    if end > limit || start > end {
        end = limit;
    }
    pos >= start && pos < end
}

fn blend(video: &Video, top: (usize, u16), below: (usize, u16), semi_transparent: bool) -> u16 {
    let first = video.bldcnt & 0x3F;
    let second = (video.bldcnt >> 8) & 0x3F;
    let below_is_target = second & (1 << below.0) != 0;

    if semi_transparent && below_is_target {
        return alpha(video, top.1, below.1);
    }
    if first & (1 << top.0) == 0 {
        return top.1;
    }
    let evy = (video.bldy & 0x1F).min(16);
    match (video.bldcnt >> 6) & 3 {
        1 if below_is_target => alpha(video, top.1, below.1),
        2 => map_channels(top.1, |c| c + (((31 - c) * evy) >> 4)),
        3 => map_channels(top.1, |c| c - ((c * evy) >> 4)),
        _ => top.1,
    }
}

fn alpha(video: &Video, a: u16, b: u16) -> u16 {
    let eva = (video.bldalpha & 0x1F).min(16);
    let evb = ((video.bldalpha >> 8) & 0x1F).min(16);
    let mut out = 0;
    for shift in [0, 5, 10] {
        let ca = (a >> shift) & 0x1F;
        let cb = (b >> shift) & 0x1F;
        out |= ((ca * eva + cb * evb) >> 4).min(31) << shift;
    }
    out
}

fn map_channels(color: u16, f: impl Fn(u16) -> u16) -> u16 {
    [0, 5, 10]
        .into_iter()
        .fold(0, |out, shift| out | (f((color >> shift) & 0x1F).min(31) << shift))
}

fn char_base(bgcnt: u16) -> u32 {
    ((bgcnt >> 2) & 3) as u32 * 0x4000
}

fn screen_base(bgcnt: u16) -> u32 {
    ((bgcnt >> 8) & 0x1F) as u32 * 0x800
}

/// Tile pixel read restricted to BG character memory.
fn bg_vram8(video: &Video, addr: u32) -> u8 {
    if addr < OBJ_VRAM_TILED {
        video.vram8(addr)
    } else {
        0
    }
}

fn text_line(video: &Video, bg: usize, line: u16, out: &mut [u16; SCREEN_WIDTH]) {
    let cnt = video.bgcnt[bg];
    let (width, height) = match cnt >> 14 {
        0 => (256, 256),
        1 => (512, 256),
        2 => (256, 512),
        _ => (512, 512),
    };
    let color_256 = cnt & 0x80 != 0;
    let chars = char_base(cnt);
    let screen = screen_base(cnt);
    let py = (line as u32 + video.bg_vofs[bg] as u32) & (height - 1);

    for (x, pixel) in out.iter_mut().enumerate() {
        let px = (x as u32 + video.bg_hofs[bg] as u32) & (width - 1);
        let (tx, ty) = (px / 8, py / 8);
        let block = (tx / 32) + (ty / 32) * (width / 256);
        let entry_addr = screen + block * 0x800 + ((ty % 32) * 32 + tx % 32) * 2;
        let entry = video.vram16(entry_addr);

        let tile = (entry & 0x3FF) as u32;
        let col = if entry & 0x400 != 0 { 7 - px % 8 } else { px % 8 };
        let row = if entry & 0x800 != 0 { 7 - py % 8 } else { py % 8 };

        *pixel = if color_256 {
            let index = bg_vram8(video, chars + tile * 64 + row * 8 + col);
            if index == 0 {
                TRANSPARENT
            } else {
                video.palette_color(index as usize)
            }
        } else {
            let byte = bg_vram8(video, chars + tile * 32 + row * 4 + col / 2);
            let index = if col & 1 == 0 { byte & 0xF } else { byte >> 4 };
            if index == 0 {
                TRANSPARENT
            } else {
                video.palette_color((entry >> 12) as usize * 16 + index as usize)
            }
        };
    }
}

fn affine_line(video: &Video, bg: usize, out: &mut [u16; SCREEN_WIDTH]) {
    let cnt = video.bgcnt[bg];
    let params = video.affine[bg - 2];
    let size = 128i32 << (cnt >> 14);
    let wrap = cnt & 0x2000 != 0;
    let chars = char_base(cnt);
    let screen = screen_base(cnt);
    let tiles_per_row = (size / 8) as u32;

    for (x, pixel) in out.iter_mut().enumerate() {
        let tx = params.internal_x.wrapping_add(params.pa as i32 * x as i32) >> 8;
        let ty = params.internal_y.wrapping_add(params.pc as i32 * x as i32) >> 8;
        let (px, py) = if wrap {
            (tx.rem_euclid(size), ty.rem_euclid(size))
        } else if (0..size).contains(&tx) && (0..size).contains(&ty) {
            (tx, ty)
        } else {
            *pixel = TRANSPARENT;
            continue;
        };
        let (px, py) = (px as u32, py as u32);
        let tile = video.vram8(screen + (py / 8) * tiles_per_row + px / 8) as u32;
        let index = bg_vram8(video, chars + tile * 64 + (py % 8) * 8 + px % 8);
        *pixel = if index == 0 {
            TRANSPARENT
        } else {
            video.palette_color(index as usize)
        };
    }
}

/// BG2 in modes 3-5, sampled through the BG2 affine transform.
fn bitmap_line(video: &Video, out: &mut [u16; SCREEN_WIDTH]) {
    let params = video.affine[0];
    let page = if video.dispcnt & DISPCNT_FRAME_SELECT != 0 {
        BITMAP_PAGE
    } else {
        0
    };
    let (width, height) = if video.mode() == 5 { (160, 128) } else { (240, 160) };

    for (x, pixel) in out.iter_mut().enumerate() {
        let px = params.internal_x.wrapping_add(params.pa as i32 * x as i32) >> 8;
        let py = params.internal_y.wrapping_add(params.pc as i32 * x as i32) >> 8;
        if !(0..width).contains(&px) || !(0..height).contains(&py) {
            *pixel = TRANSPARENT;
            continue;
        }
        let offset = (py * width + px) as u32;
        *pixel = match video.mode() {
            3 => video.vram16(offset * 2) & 0x7FFF,
            4 => match video.vram8(page + offset) {
                0 => TRANSPARENT,
                index => video.palette_color(index as usize),
            },
            _ => video.vram16(page + offset * 2) & 0x7FFF,
        };
    }
}

fn obj_line(
    video: &Video,
    line: u16,
    out: &mut [ObjPixel; SCREEN_WIDTH],
    obj_window: &mut [bool; SCREEN_WIDTH],
) {
    let one_dimensional = video.dispcnt & DISPCNT_OBJ_1D != 0;
    let line = line as i32;

    for index in 0..128u32 {
        let attr0 = video.oam16(index * 8);
        let attr1 = video.oam16(index * 8 + 2);
        let attr2 = video.oam16(index * 8 + 4);

        let affine = attr0 & 0x100 != 0;
        let double = attr0 & 0x200 != 0;
        if !affine && double {
            continue;
        }
        let mode = (attr0 >> 10) & 3;
        let shape = (attr0 >> 14) as usize;
        if mode == 3 || shape == 3 {
            continue;
        }
        let (width, height) = OBJ_DIMENSIONS[shape][(attr1 >> 14) as usize];
        let (box_w, box_h) = if double { (width * 2, height * 2) } else { (width, height) };

        let mut y = (attr0 & 0xFF) as i32;
        if y >= SCREEN_HEIGHT as i32 {
            y -= 256;
        }
        if line < y || line >= y + box_h {
            continue;
        }
        let mut x = (attr1 & 0x1FF) as i32;
        if x >= 256 {
            x -= 512;
        }

        let tile = (attr2 & 0x3FF) as u32;
        if video.bitmap_mode() && tile < 512 {
            continue;
        }
        let priority = ((attr2 >> 10) & 3) as u8;
        let palette_bank = (attr2 >> 12) as usize;
        let color_256 = attr0 & 0x2000 != 0;

        // Texture coordinate for each on-screen column of the box.
        let (pa, pb, pc, pd) = if affine {
            let group = ((attr1 >> 9) & 0x1F) as u32 * 32;
            (
                video.oam16(group + 6) as i16 as i32,
                video.oam16(group + 14) as i16 as i32,
                video.oam16(group + 22) as i16 as i32,
                video.oam16(group + 30) as i16 as i32,
            )
        } else {
            (0x100, 0, 0, 0x100)
        };
        let dy = line - y - box_h / 2;

        for bx in 0..box_w {
            let sx = x + bx;
            if !(0..SCREEN_WIDTH as i32).contains(&sx) {
                continue;
            }
            let dx = bx - box_w / 2;
            let (mut tx, mut ty) = (
                ((pa * dx + pb * dy) >> 8) + width / 2,
                ((pc * dx + pd * dy) >> 8) + height / 2,
            );
            if !(0..width).contains(&tx) || !(0..height).contains(&ty) {
                continue;
            }
            if !affine {
                if attr1 & 0x1000 != 0 {
                    tx = width - 1 - tx;
                }
                if attr1 & 0x2000 != 0 {
                    ty = height - 1 - ty;
                }
            }

            let color_index = obj_texel(
                video,
                tile,
                (tx as u32, ty as u32),
                width as u32,
                color_256,
                one_dimensional,
            );
            if color_index == 0 {
                continue;
            }
            let sx = sx as usize;
            if mode == 2 {
                obj_window[sx] = true;
                continue;
            }
            if out[sx].color != TRANSPARENT && out[sx].priority <= priority {
                continue;
            }
            let palette_index = if color_256 {
                256 + color_index as usize
            } else {
                256 + palette_bank * 16 + color_index as usize
            };
            out[sx] = ObjPixel {
                color: video.palette_color(palette_index),
                priority,
                semi_transparent: mode == 1,
            };
        }
    }
}

/// Palette index (0 = transparent) of texel `(tx, ty)` of a sprite whose
/// first tile is `tile`.
fn obj_texel(
    video: &Video,
    tile: u32,
    (tx, ty): (u32, u32),
    width: u32,
    color_256: bool,
    one_dimensional: bool,
) -> u8 {
    let tiles_wide = width / 8;
    let (col, row) = (tx / 8, ty / 8);
    let tile_number = if color_256 {
        let stride = if one_dimensional { tiles_wide * 2 } else { 32 };
        tile + row * stride + col * 2
    } else {
        let stride = if one_dimensional { tiles_wide } else { 32 };
        tile + row * stride + col
    };
    let base = OBJ_VRAM_TILED + (tile_number & 0x3FF) * 32;
    if color_256 {
        video.vram8(base + (ty % 8) * 8 + tx % 8)
    } else {
        let byte = video.vram8(base + (ty % 8) * 4 + (tx % 8) / 2);
        if tx & 1 == 0 { byte & 0xF } else { byte >> 4 }
    }
}
