use std::ops::Range;

/// Splits `total` chapters into consecutive parts of at most `cap` chapters.
/// No cap (or a zero cap) yields one part.
pub fn plan_parts(total: usize, cap: Option<usize>) -> Vec<Range<usize>> {
    let cap = match cap {
        Some(c) if c > 0 && total > c => c,
        _ => return vec![0..total],
    };

    let mut parts = Vec::new();
    let mut start = 0usize;
    while start < total {
        let end = (start + cap).min(total);
        parts.push(start..end);
        start = end;
    }
    parts
}

/// Locates the part a cursor belongs to. `buffered` is the number of chapters
/// already accumulated for the current (unsaved) part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartPosition {
    pub index: usize,
    pub count: usize,
    pub range: Range<usize>,
}

pub fn part_at(cursor: usize, buffered: usize, total: usize, cap: Option<usize>) -> PartPosition {
    let parts = plan_parts(total, cap);
    let count = parts.len();
    let part_start = cursor.saturating_sub(buffered);
    let index = parts
        .iter()
        .position(|r| r.contains(&part_start))
        .unwrap_or(count.saturating_sub(1));
    PartPosition { index, count, range: parts[index].clone() }
}

pub fn part_title(title: &str, index: usize, count: usize) -> String {
    if count <= 1 {
        title.to_string()
    } else {
        format!("{} (часть {} из {})", title, index + 1, count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncapped_is_single_part() {
        assert_eq!(plan_parts(120, None), vec![0..120]);
        assert_eq!(plan_parts(80, Some(80)), vec![0..80]);
        assert_eq!(plan_parts(0, Some(80)), vec![0..0]);
    }

    #[test]
    fn capped_splits_sequentially() {
        assert_eq!(plan_parts(170, Some(80)), vec![0..80, 80..160, 160..170]);
    }

    #[test]
    fn cursor_resolves_to_its_part() {
        let p = part_at(85, 5, 170, Some(80));
        assert_eq!(p.index, 1);
        assert_eq!(p.count, 3);
        assert_eq!(p.range, 80..160);

        let p = part_at(80, 0, 170, Some(80));
        assert_eq!(p.index, 1);

        let p = part_at(3, 3, 5, None);
        assert_eq!(p.range, 0..5);
    }

    #[test]
    fn title_suffix_only_when_split() {
        assert_eq!(part_title("Book", 0, 1), "Book");
        assert_eq!(part_title("Book", 1, 3), "Book (часть 2 из 3)");
    }
}
