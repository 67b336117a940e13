//! US-ANSI virtual key codes
//!
//! Used when the keyboard tap delivers a key without decoded text, which
//! happens for non-printing keys and while modifier chords are held.

/// Printable character for a key on a US-ANSI layout
pub fn printable(key_code: u16, shift: bool) -> Option<char> {
    let (plain, shifted) = match key_code {
        0x00 => ('a', 'A'),
        0x01 => ('s', 'S'),
        0x02 => ('d', 'D'),
        0x03 => ('f', 'F'),
        0x04 => ('h', 'H'),
        0x05 => ('g', 'G'),
        0x06 => ('z', 'Z'),
        0x07 => ('x', 'X'),
        0x08 => ('c', 'C'),
        0x09 => ('v', 'V'),
        0x0B => ('b', 'B'),
        0x0C => ('q', 'Q'),
        0x0D => ('w', 'W'),
        0x0E => ('e', 'E'),
        0x0F => ('r', 'R'),
        0x10 => ('y', 'Y'),
        0x11 => ('t', 'T'),
        0x12 => ('1', '!'),
        0x13 => ('2', '@'),
        0x14 => ('3', '#'),
        0x15 => ('4', '$'),
        0x16 => ('6', '^'),
        0x17 => ('5', '%'),
        0x18 => ('=', '+'),
        0x19 => ('9', '('),
        0x1A => ('7', '&'),
        0x1B => ('-', '_'),
        0x1C => ('8', '*'),
        0x1D => ('0', ')'),
        0x1E => (']', '}'),
        0x1F => ('o', 'O'),
        0x20 => ('u', 'U'),
        0x21 => ('[', '{'),
        0x22 => ('i', 'I'),
        0x23 => ('p', 'P'),
        0x25 => ('l', 'L'),
        0x26 => ('j', 'J'),
        0x27 => ('\'', '"'),
        0x28 => ('k', 'K'),
        0x29 => (';', ':'),
        0x2A => ('\\', '|'),
        0x2B => (',', '<'),
        0x2C => ('/', '?'),
        0x2D => ('n', 'N'),
        0x2E => ('m', 'M'),
        0x2F => ('.', '>'),
        0x31 => (' ', ' '),
        0x32 => ('`', '~'),
        _ => return None,
    };
    Some(if shift { shifted } else { plain })
}

/// Name of a non-printing key
pub fn key_name(key_code: u16) -> Option<&'static str> {
    Some(match key_code {
        0x24 => "return",
        0x30 => "tab",
        0x33 => "delete",
        0x35 => "escape",
        0x37 => "command",
        0x38 => "shift",
        0x39 => "capsLock",
        0x3A => "option",
        0x3B => "control",
        0x3C => "rightShift",
        0x3D => "rightOption",
        0x3E => "rightControl",
        0x3F => "function",
        0x36 => "rightCommand",
        0x4C => "enter",
        0x60 => "f5",
        0x61 => "f6",
        0x62 => "f7",
        0x63 => "f3",
        0x64 => "f8",
        0x65 => "f9",
        0x67 => "f11",
        0x6D => "f10",
        0x6F => "f12",
        0x73 => "home",
        0x74 => "pageUp",
        0x75 => "forwardDelete",
        0x76 => "f4",
        0x77 => "end",
        0x78 => "f2",
        0x79 => "pageDown",
        0x7A => "f1",
        0x7B => "left",
        0x7C => "right",
        0x7D => "down",
        0x7E => "up",
        _ => return None,
    })
}

fn is_unprintable(c: char) -> bool {
    c.is_control() || ('\u{F700}'..='\u{F8FF}').contains(&c)
}

/// Best text for the `character` column.
///
/// Control characters and the function-key private use range from the tap
/// are replaced by the key name.
pub fn describe(key_code: u16, text: Option<&str>, shift: bool) -> Option<String> {
    if let Some(text) = text {
        if !text.is_empty() && !text.chars().any(is_unprintable) {
            return Some(text.to_string());
        }
    }
    key_name(key_code)
        .map(str::to_string)
        .or_else(|| printable(key_code, shift).map(String::from))
}
