//! VGA text console: an 80x25 cursor-tracked writer at 0xB8000.
//!
//! The console keeps a software cursor (row, column) that starts at the
//! top-left and walks down the screen; the display scrolls only once the
//! cursor passes the last row. `\n`, `\r` and `\b` move the cursor, and
//! the hardware cursor is kept in sync through the CRTC index/data ports
//! so the blinking block always sits where the next byte lands.
//!
//! Each cell is one 16-bit word: character byte in the low half,
//! attribute (foreground | background << 4) in the high half. All buffer
//! access is volatile.

use core::fmt;

use lazy_static::lazy_static;
use spin::Mutex;

pub const VGA_WIDTH: usize = 80;
pub const VGA_HEIGHT: usize = 25;

const VGA_BUFFER: *mut VgaCell = 0xb8000 as *mut VgaCell;

/// CRTC register ports for the hardware cursor.
#[cfg_attr(not(target_os = "none"), allow(dead_code))]
const CRTC_INDEX: u16 = 0x3D4;
#[cfg_attr(not(target_os = "none"), allow(dead_code))]
const CRTC_DATA: u16 = 0x3D5;
#[cfg_attr(not(target_os = "none"), allow(dead_code))]
const CRTC_CURSOR_HIGH: u8 = 0x0E;
#[cfg_attr(not(target_os = "none"), allow(dead_code))]
const CRTC_CURSOR_LOW: u8 = 0x0F;

/// VGA text-mode color palette.
#[allow(dead_code)] // Full 16-color palette per the VGA hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Color {
    Black = 0,
    Blue = 1,
    Green = 2,
    Cyan = 3,
    Red = 4,
    Magenta = 5,
    Brown = 6,
    LightGray = 7,
    DarkGray = 8,
    LightBlue = 9,
    LightGreen = 10,
    LightCyan = 11,
    LightRed = 12,
    Pink = 13,
    Yellow = 14,
    White = 15,
}

/// A cell attribute: foreground in the low nibble, background in the
/// high nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Attr(u8);

impl Attr {
    pub const fn new(foreground: Color, background: Color) -> Self {
        Self(((background as u8) << 4) | (foreground as u8))
    }
}

/// One character cell as the hardware reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
struct VgaCell(u16);

impl VgaCell {
    const fn new(byte: u8, attr: Attr) -> Self {
        Self(((attr.0 as u16) << 8) | byte as u16)
    }

    const fn blank(attr: Attr) -> Self {
        Self::new(b' ', attr)
    }
}

/// The console state: cursor position, current attribute, and the cell
/// buffer.
pub struct Console {
    row: usize,
    column: usize,
    attr: Attr,
    buffer: *mut VgaCell,
}

// SAFETY: the raw buffer pointer is only dereferenced while the owning
// Mutex is held; there is a single Console per buffer.
unsafe impl Send for Console {}

impl Console {
    fn cell_at(&self, row: usize, column: usize) -> *mut VgaCell {
        debug_assert!(row < VGA_HEIGHT && column < VGA_WIDTH);
        // SAFETY: the index is bounded by the debug_assert invariant the
        // cursor logic maintains; the buffer spans VGA_HEIGHT * VGA_WIDTH
        // cells.
        unsafe { self.buffer.add(row * VGA_WIDTH + column) }
    }

    fn store(&mut self, row: usize, column: usize, cell: VgaCell) {
        // SAFETY: cell_at stays in bounds; volatile keeps the MMIO store.
        unsafe { core::ptr::write_volatile(self.cell_at(row, column), cell) };
    }

    fn load(&self, row: usize, column: usize) -> VgaCell {
        // SAFETY: as in `store`; volatile read from MMIO.
        unsafe { core::ptr::read_volatile(self.cell_at(row, column)) }
    }

    /// Place one byte at the cursor and advance it.
    pub fn put_byte(&mut self, byte: u8) {
        match byte {
            b'\n' => {
                self.column = 0;
                self.row += 1;
            }
            b'\r' => {
                self.column = 0;
            }
            b'\x08' => {
                if self.column > 0 {
                    self.column -= 1;
                    let blank = VgaCell::blank(self.attr);
                    self.store(self.row, self.column, blank);
                }
            }
            byte => {
                let printable = matches!(byte, 0x20..=0x7e);
                // Unprintable bytes show as the VGA block glyph.
                let shown = if printable { byte } else { 0xfe };
                let cell = VgaCell::new(shown, self.attr);
                self.store(self.row, self.column, cell);
                self.column += 1;
            }
        }

        if self.column >= VGA_WIDTH {
            self.column = 0;
            self.row += 1;
        }
        if self.row >= VGA_HEIGHT {
            self.scroll();
        }

        self.sync_cursor();
    }

    pub fn write_string(&mut self, s: &str) {
        for byte in s.bytes() {
            self.put_byte(byte);
        }
    }

    /// Shift every row up by one and blank the last; the cursor stays on
    /// the bottom row.
    fn scroll(&mut self) {
        for row in 1..VGA_HEIGHT {
            for column in 0..VGA_WIDTH {
                let cell = self.load(row, column);
                self.store(row - 1, column, cell);
            }
        }
        let blank = VgaCell::blank(self.attr);
        for column in 0..VGA_WIDTH {
            self.store(VGA_HEIGHT - 1, column, blank);
        }
        self.row = VGA_HEIGHT - 1;
    }

    /// Blank the screen and home the cursor.
    pub fn clear(&mut self) {
        let blank = VgaCell::blank(self.attr);
        for row in 0..VGA_HEIGHT {
            for column in 0..VGA_WIDTH {
                self.store(row, column, blank);
            }
        }
        self.row = 0;
        self.column = 0;
        self.sync_cursor();
    }

    /// Move the hardware cursor to the software cursor position.
    fn sync_cursor(&self) {
        #[cfg(target_os = "none")]
        {
            let pos = (self.row * VGA_WIDTH + self.column) as u16;
            // SAFETY: the CRTC index/data pair at 0x3D4/0x3D5 is the
            // documented interface for the text-mode cursor registers.
            unsafe {
                super::outb(CRTC_INDEX, CRTC_CURSOR_LOW);
                super::outb(CRTC_DATA, pos as u8);
                super::outb(CRTC_INDEX, CRTC_CURSOR_HIGH);
                super::outb(CRTC_DATA, (pos >> 8) as u8);
            }
        }
    }
}

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_string(s);
        Ok(())
    }
}

lazy_static! {
    pub static ref WRITER: Mutex<Console> = Mutex::new(Console {
        row: 0,
        column: 0,
        attr: Attr::new(Color::LightGray, Color::Black),
        // The VGA text buffer is identity-mapped by the loader and lives
        // for the kernel's lifetime; the Mutex serialises all access.
        buffer: VGA_BUFFER,
    });
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;

    use x86_64::instructions::interrupts;

    // Interrupt handlers also print; taking the lock with IF set would
    // deadlock against them on this single CPU.
    interrupts::without_interrupts(|| {
        let _ = WRITER.lock().write_fmt(args);
    });
}

/// Clear the screen at boot.
pub fn clear() {
    use x86_64::instructions::interrupts;

    interrupts::without_interrupts(|| {
        WRITER.lock().clear();
    });
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    extern crate std;
    use std::{vec, vec::Vec};

    use super::*;

    #[test]
    fn test_cell_encoding_matches_hardware_layout() {
        let attr = Attr::new(Color::LightGray, Color::Black);
        assert_eq!(VgaCell::new(b'A', attr), VgaCell(0x0741));

        let attr = Attr::new(Color::White, Color::Blue);
        assert_eq!(VgaCell::new(b'!', attr).0, 0x1F21);
        assert_eq!(VgaCell::blank(attr).0, 0x1F20);
    }

    /// Console over a host-allocated cell buffer.
    struct TestConsole {
        _cells: Vec<VgaCell>,
        console: Console,
    }

    fn test_console() -> TestConsole {
        let mut cells = vec![VgaCell::blank(Attr::new(Color::LightGray, Color::Black)); VGA_WIDTH * VGA_HEIGHT];
        let console = Console {
            row: 0,
            column: 0,
            attr: Attr::new(Color::LightGray, Color::Black),
            buffer: cells.as_mut_ptr(),
        };
        TestConsole {
            _cells: cells,
            console,
        }
    }

    fn char_at(t: &TestConsole, row: usize, column: usize) -> u8 {
        (t._cells[row * VGA_WIDTH + column].0 & 0xFF) as u8
    }

    #[test]
    fn test_cursor_walks_from_top_left() {
        let mut t = test_console();
        t.console.write_string("hi\nthere");

        assert_eq!(char_at(&t, 0, 0), b'h');
        assert_eq!(char_at(&t, 0, 1), b'i');
        assert_eq!(char_at(&t, 1, 0), b't');
        assert_eq!(t.console.row, 1);
        assert_eq!(t.console.column, 5);
    }

    #[test]
    fn test_carriage_return_and_backspace() {
        let mut t = test_console();
        t.console.write_string("abc\rX");
        // \r rewinds to column 0; X overwrites a.
        assert_eq!(char_at(&t, 0, 0), b'X');
        assert_eq!(char_at(&t, 0, 1), b'b');

        t.console.write_string("\x08");
        // Backspace blanks the previous cell and steps back onto it.
        assert_eq!(char_at(&t, 0, 0), b' ');
        assert_eq!(t.console.column, 0);
    }

    #[test]
    fn test_long_line_wraps() {
        let mut t = test_console();
        for _ in 0..(VGA_WIDTH + 3) {
            t.console.put_byte(b'x');
        }
        assert_eq!(t.console.row, 1);
        assert_eq!(t.console.column, 3);
        assert_eq!(char_at(&t, 1, 2), b'x');
    }

    #[test]
    fn test_scroll_at_bottom_keeps_cursor_on_last_row() {
        let mut t = test_console();
        // 25 labelled lines: the newline after the last one pushes the
        // cursor past the bottom and forces exactly one scroll.
        for i in 0..VGA_HEIGHT {
            t.console.put_byte(b'a' + (i % 26) as u8);
            t.console.put_byte(b'\n');
        }

        assert_eq!(t.console.row, VGA_HEIGHT - 1);
        // The first line scrolled off; row 0 now holds the second line.
        assert_eq!(char_at(&t, 0, 0), b'b');
        // The bottom row was blanked for new output.
        assert_eq!(char_at(&t, VGA_HEIGHT - 1, 0), b' ');
    }

    #[test]
    fn test_unprintable_bytes_render_as_block() {
        let mut t = test_console();
        t.console.put_byte(0x01);
        assert_eq!(char_at(&t, 0, 0), 0xfe);
    }

    #[test]
    fn test_clear_homes_the_cursor() {
        let mut t = test_console();
        t.console.write_string("some text\nmore");
        t.console.clear();

        assert_eq!(t.console.row, 0);
        assert_eq!(t.console.column, 0);
        assert_eq!(char_at(&t, 0, 0), b' ');
        assert_eq!(char_at(&t, 1, 0), b' ');
    }
}
