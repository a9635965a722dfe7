// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire-text mapping of messages.
//!
//! MQTT-SN payloads are short text strings: `1`, `off`, `toggle`, `#`, `+`,
//! `!0.5`, `0.5 2s`, `0.1 0.25/s`. Writing always uses the compact symbol
//! forms; parsing also accepts the word forms.

use crate::{
    invert_on_off, swap_up_down, FloatWithFlag, Message, MessageType,
};
use core::fmt::Write;

pub const MAX_TEXT_LENGTH: usize = 24;

pub type Text = heapless::String<MAX_TEXT_LENGTH>;

/// Renders a message as payload text. `None` for types that cannot be
/// published as text.
pub fn write(msg: &Message) -> Option<Text> {
    const ON_OFF: [char; 3] = ['0', '1', '!'];
    const TRIGGER: [char; 2] = ['#', '!'];
    const UP_DOWN: [char; 3] = ['#', '+', '-'];

    let mut out = Text::new();
    match *msg {
        Message::OnOff(v) => out.push(*ON_OFF.get(v as usize)?).ok()?,
        Message::OnOff2(v) => {
            out.push(*ON_OFF.get(invert_on_off(v) as usize)?).ok()?
        }
        Message::Trigger(v) | Message::Trigger2(v) => {
            out.push(*TRIGGER.get(v as usize)?).ok()?
        }
        Message::UpDown(v) => out.push(*UP_DOWN.get(v as usize)?).ok()?,
        Message::UpDown2(v) => {
            out.push(*UP_DOWN.get(swap_up_down(v) as usize)?).ok()?
        }
        Message::Level(level) => {
            if level.flag() {
                out.push('!').ok()?;
            }
            write_float(&mut out, level.value())?;
        }
        Message::MoveToLevel { level, mov } => {
            if level.flag() {
                out.push('!').ok()?;
            }
            write_float(&mut out, level.value())?;
            out.push(' ').ok()?;
            write_float(&mut out, mov.value())?;
            if mov.flag() {
                out.push('/').ok()?;
            }
            out.push('s').ok()?;
        }
        Message::Celsius(v) | Message::Fahrenheit(v) => {
            write_float(&mut out, v.value())?
        }
        Message::AirPressure(v) | Message::Resistance(v) => {
            write_float(&mut out, v)?
        }
    }
    Some(out)
}

/// Parses payload text into a message of type `dst`. `None` when the text
/// does not fit the type's grammar.
pub fn parse(dst: MessageType, text: &str) -> Option<Message> {
    const ON_OFF: [(&str, u8); 6] = [
        ("0", 0),
        ("1", 1),
        ("!", 2),
        ("off", 0),
        ("on", 1),
        ("toggle", 2),
    ];
    const TRIGGER: [(&str, u8); 4] =
        [("#", 0), ("!", 1), ("inactive", 0), ("active", 1)];
    const UP_DOWN: [(&str, u8); 6] = [
        ("#", 0),
        ("+", 1),
        ("-", 2),
        ("inactive", 0),
        ("up", 1),
        ("down", 2),
    ];

    let text = text.trim();
    Some(match dst {
        MessageType::OnOff => Message::OnOff(find(text, &ON_OFF)?),
        MessageType::OnOff2 => {
            Message::OnOff2(invert_on_off(find(text, &ON_OFF)?))
        }
        MessageType::Trigger => Message::Trigger(find(text, &TRIGGER)?),
        MessageType::Trigger2 => Message::Trigger2(find(text, &TRIGGER)?),
        MessageType::UpDown => Message::UpDown(find(text, &UP_DOWN)?),
        MessageType::UpDown2 => {
            Message::UpDown2(swap_up_down(find(text, &UP_DOWN)?))
        }
        MessageType::Level | MessageType::MoveToLevel => {
            let (relative, rest) = match text.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, text),
            };
            let (value, rest) = take_float(rest)?;
            let level = FloatWithFlag::new(value, relative);
            if dst == MessageType::Level {
                if !rest.trim().is_empty() {
                    return None;
                }
                Message::Level(level)
            } else {
                let rest = rest.trim_start();
                let mov = if rest.is_empty() {
                    FloatWithFlag::new(0.0, false)
                } else {
                    let (value, rest) = take_float(rest)?;
                    let rate = match rest {
                        "s" => false,
                        "/s" => true,
                        _ => return None,
                    };
                    FloatWithFlag::new(value, rate)
                };
                Message::MoveToLevel { level, mov }
            }
        }
        MessageType::Celsius => {
            Message::Celsius(FloatWithFlag::new(parse_float(text)?, false))
        }
        MessageType::Fahrenheit => {
            Message::Fahrenheit(FloatWithFlag::new(parse_float(text)?, false))
        }
        MessageType::AirPressure => Message::AirPressure(parse_float(text)?),
        MessageType::Resistance => Message::Resistance(parse_float(text)?),
        MessageType::Unknown => return None,
    })
}

fn find(text: &str, table: &[(&str, u8)]) -> Option<u8> {
    table.iter().find(|(s, _)| *s == text).map(|&(_, v)| v)
}

fn parse_float(text: &str) -> Option<f32> {
    let (v, rest) = take_float(text)?;
    rest.is_empty().then_some(v)
}

/// Splits the leading float off `text`; the remainder keeps any suffix such
/// as `s` or `/s`.
fn take_float(text: &str) -> Option<(f32, &str)> {
    let end = text
        .find(|c: char| !c.is_ascii_digit() && c != '.' && c != '-' && c != '+')
        .unwrap_or(text.len());
    if end == 0 {
        return None;
    }
    let value: f32 = text[..end].parse().ok()?;
    Some((value, &text[end..]))
}

/// Writes a float with up to three decimals, at least one.
fn write_float(out: &mut Text, value: f32) -> Option<()> {
    let negative = value < 0.0;
    let scaled = (value.abs() * 1000.0 + 0.5) as u64;
    let int = scaled / 1000;
    let mut frac = scaled % 1000;
    // drop trailing zeros but keep one decimal
    let mut digits = 3;
    while digits > 1 && frac % 10 == 0 {
        frac /= 10;
        digits -= 1;
    }
    if negative && scaled != 0 {
        out.push('-').ok()?;
    }
    write!(out, "{int}.{frac:0width$}", width = digits).ok()?;
    Some(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_symbols() {
        assert_eq!(write(&Message::OnOff(0)).unwrap(), "0");
        assert_eq!(write(&Message::OnOff(1)).unwrap(), "1");
        assert_eq!(write(&Message::OnOff(2)).unwrap(), "!");
        // inverted interpretation writes the inverted symbol
        assert_eq!(write(&Message::OnOff2(0)).unwrap(), "1");
        assert_eq!(write(&Message::UpDown(1)).unwrap(), "+");
        assert_eq!(write(&Message::UpDown2(1)).unwrap(), "-");
        assert_eq!(write(&Message::Trigger(1)).unwrap(), "!");
    }

    #[test]
    fn binary_words_parse() {
        assert_eq!(
            parse(MessageType::OnOff, "toggle"),
            Some(Message::OnOff(2))
        );
        assert_eq!(parse(MessageType::OnOff, "on"), Some(Message::OnOff(1)));
        assert_eq!(
            parse(MessageType::UpDown, "down"),
            Some(Message::UpDown(2))
        );
        assert_eq!(
            parse(MessageType::Trigger, "active"),
            Some(Message::Trigger(1))
        );
        assert_eq!(parse(MessageType::OnOff, "sideways"), None);
    }

    #[test]
    fn level_forms() {
        assert_eq!(write(&Message::Level(0.5.into())).unwrap(), "0.5");
        assert_eq!(
            write(&Message::Level(FloatWithFlag::new(0.1, true))).unwrap(),
            "!0.1"
        );
        assert_eq!(
            parse(MessageType::Level, "0.5"),
            Some(Message::Level(FloatWithFlag::new(0.5, false)))
        );
        let m = parse(MessageType::Level, "!0.25").unwrap();
        match m {
            Message::Level(l) => {
                assert!(l.flag());
                assert!((l.value() - 0.25).abs() < 1e-3);
            }
            _ => panic!(),
        }
    }

    #[test]
    fn move_to_level_forms() {
        let m = Message::MoveToLevel {
            level: FloatWithFlag::new(1.0, false),
            mov: FloatWithFlag::new(2.0, false),
        };
        assert_eq!(write(&m).unwrap(), "1.0 2.0s");
        let m = Message::MoveToLevel {
            level: FloatWithFlag::new(0.5, true),
            mov: FloatWithFlag::new(0.25, true),
        };
        assert_eq!(write(&m).unwrap(), "!0.5 0.25/s");

        match parse(MessageType::MoveToLevel, "0.5 2s").unwrap() {
            Message::MoveToLevel { level, mov } => {
                assert!((level.value() - 0.5).abs() < 1e-3);
                assert!(!mov.flag());
                assert!((mov.value() - 2.0).abs() < 1e-3);
            }
            _ => panic!(),
        }
        match parse(MessageType::MoveToLevel, "0.1 0.5/s").unwrap() {
            Message::MoveToLevel { mov, .. } => assert!(mov.flag()),
            _ => panic!(),
        }
        // bare level is a move with no duration
        match parse(MessageType::MoveToLevel, "0.75").unwrap() {
            Message::MoveToLevel { mov, .. } => {
                assert_eq!(mov.value(), 0.0)
            }
            _ => panic!(),
        }
        assert_eq!(parse(MessageType::MoveToLevel, "0.5 2x"), None);
    }

    #[test]
    fn round_trip_through_text() {
        let samples = [
            Message::OnOff(2),
            Message::UpDown(1),
            Message::Trigger(1),
            Message::Level(FloatWithFlag::new(0.125, false)),
            Message::MoveToLevel {
                level: FloatWithFlag::new(0.5, true),
                mov: FloatWithFlag::new(3.0, false),
            },
        ];
        for m in samples {
            let text = write(&m).unwrap();
            let back = parse(m.message_type(), &text).unwrap();
            match (m, back) {
                (Message::Level(a), Message::Level(b)) => {
                    assert_eq!(a.flag(), b.flag());
                    assert!((a.value() - b.value()).abs() < 1e-3);
                }
                (
                    Message::MoveToLevel { level: a, mov: am },
                    Message::MoveToLevel { level: b, mov: bm },
                ) => {
                    assert!((a.value() - b.value()).abs() < 1e-3);
                    assert_eq!(am.flag(), bm.flag());
                    assert!((am.value() - bm.value()).abs() < 1e-3);
                }
                (a, b) => assert_eq!(a, b),
            }
        }
    }
}
