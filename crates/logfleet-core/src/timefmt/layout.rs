//! Reference-time layouts compiled to chrono format items.
//!
//! A layout spells the reference instant `Mon Jan 2 15:04:05 2006 -0700` in the shape the
//! log uses, e.g. `Jan _2 15:04:05` or `2006-01-02T15:04:05.000000Z07:00`.

use chrono::format::{Fixed, Item, Numeric, Pad};

/// Longest tokens first so `.000000` wins over `.000`.
const TOKENS: &[&str] = &[
    ".000000000",
    ".000000",
    ".000",
    "Z07:00",
    "-07:00",
    "-0700",
    "2006",
    "Jan",
    "_2",
    "01",
    "02",
    "15",
    "04",
    "05",
];

fn token_item(token: &str) -> Item<'static> {
    match token {
        ".000" | ".000000" | ".000000000" => Item::Fixed(Fixed::Nanosecond),
        "Z07:00" => Item::Fixed(Fixed::TimezoneOffsetColonZ),
        "-07:00" => Item::Fixed(Fixed::TimezoneOffsetColon),
        "-0700" => Item::Fixed(Fixed::TimezoneOffset),
        "2006" => Item::Numeric(Numeric::Year, Pad::Zero),
        "Jan" => Item::Fixed(Fixed::ShortMonthName),
        "_2" => Item::Numeric(Numeric::Day, Pad::Space),
        "01" => Item::Numeric(Numeric::Month, Pad::Zero),
        "02" => Item::Numeric(Numeric::Day, Pad::Zero),
        "15" => Item::Numeric(Numeric::Hour, Pad::Zero),
        "04" => Item::Numeric(Numeric::Minute, Pad::Zero),
        "05" => Item::Numeric(Numeric::Second, Pad::Zero),
        _ => Item::Error,
    }
}

pub(crate) fn compile(layout: &'static str) -> Vec<Item<'static>> {
    let mut items = Vec::new();
    let mut pos = 0;
    while pos < layout.len() {
        let rest = &layout[pos..];
        if let Some(token) = TOKENS.iter().find(|token| rest.starts_with(**token)) {
            items.push(token_item(token));
            pos += token.len();
            continue;
        }
        let len = rest.chars().next().map_or(1, char::len_utf8);
        let text = &layout[pos..pos + len];
        if text == " " {
            items.push(Item::Space(text));
        } else {
            items.push(Item::Literal(text));
        }
        pos += len;
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_syslog_layout() {
        let items = compile("Jan _2 15:04:05");
        assert_eq!(
            items,
            vec![
                Item::Fixed(Fixed::ShortMonthName),
                Item::Space(" "),
                Item::Numeric(Numeric::Day, Pad::Space),
                Item::Space(" "),
                Item::Numeric(Numeric::Hour, Pad::Zero),
                Item::Literal(":"),
                Item::Numeric(Numeric::Minute, Pad::Zero),
                Item::Literal(":"),
                Item::Numeric(Numeric::Second, Pad::Zero),
            ]
        );
    }

    #[test]
    fn offset_tokens_are_not_split_into_fields() {
        let items = compile("2006-01-02T15:04:05.000Z07:00");
        assert_eq!(items.last(), Some(&Item::Fixed(Fixed::TimezoneOffsetColonZ)));
        assert!(items.contains(&Item::Fixed(Fixed::Nanosecond)));
        assert_eq!(items.len(), 13);
    }
}
