//! Line information for mapping bytecode back to source lines.

/// One breakable statement start.
///
/// `packed` holds `line << 8 | opcode`, where the low byte is the opcode
/// that originally lived at `ip`. Setting a breakpoint overwrites the code
/// word with `BREAK`; the low byte is what gets executed in its place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineBreakPair {
    pub packed: u32,
    pub ip: u32,
}

impl LineBreakPair {
    pub fn new(line: u32, opcode: u8, ip: u32) -> Self {
        Self {
            packed: (line << 8) | opcode as u32,
            ip,
        }
    }

    pub fn line(&self) -> u32 {
        self.packed >> 8
    }

    pub fn opcode_byte(&self) -> u8 {
        (self.packed & 0xFF) as u8
    }

    pub fn set_opcode_byte(&mut self, opcode: u8) {
        self.packed = (self.packed & !0xFF) | opcode as u32;
    }
}

/// Find the pair covering `ip`: the one with the largest ip not past it.
/// Returns the source line and the saved opcode byte.
pub fn find_break_line(pairs: &[LineBreakPair], ip: u32) -> Option<(u32, u8)> {
    let mut best: Option<&LineBreakPair> = None;
    for pair in pairs {
        if pair.ip <= ip {
            match best {
                Some(b) if pair.ip < b.ip => {}
                _ => best = Some(pair),
            }
        }
    }
    best.map(|p| (p.line(), p.opcode_byte()))
}

/// Smallest breakable line at or after `line`, or 0 when there is none.
pub fn find_first_break_line(pairs: &[LineBreakPair], line: u32) -> u32 {
    pairs
        .iter()
        .map(LineBreakPair::line)
        .filter(|&l| l >= line)
        .min()
        .unwrap_or(0)
}

/// Encode the breakable lines as alternating (skip, run) counts.
///
/// Starting at line 0, skip `skip` lines, then `run` consecutive lines are
/// breakable, and so on.
pub fn calc_break_list(pairs: &[LineBreakPair]) -> Vec<u32> {
    let mut lines: Vec<u32> = pairs.iter().map(LineBreakPair::line).collect();
    lines.sort_unstable();
    lines.dedup();

    let mut list = Vec::new();
    let mut last: Option<u32> = None;
    let mut run = 0u32;
    for line in lines {
        match last {
            Some(prev) if line == prev + 1 => run += 1,
            _ => {
                if run > 0 {
                    list.push(run);
                }
                let skip = match last {
                    Some(prev) => line - prev - 1,
                    None => line.saturating_sub(1),
                };
                list.push(skip);
                run = 1;
            }
        }
        last = Some(line);
    }
    if run > 0 {
        list.push(run);
    }
    list
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(lines: &[(u32, u32)]) -> Vec<LineBreakPair> {
        lines
            .iter()
            .map(|&(line, ip)| LineBreakPair::new(line, 62, ip))
            .collect()
    }

    #[test]
    fn test_packing() {
        let mut p = LineBreakPair::new(12, 5, 40);
        assert_eq!(p.line(), 12);
        assert_eq!(p.opcode_byte(), 5);
        p.set_opcode_byte(65);
        assert_eq!(p.line(), 12);
        assert_eq!(p.opcode_byte(), 65);
    }

    #[test]
    fn test_find_break_line_takes_nearest_preceding() {
        let p = pairs(&[(1, 0), (2, 4), (5, 9)]);
        assert_eq!(find_break_line(&p, 0), Some((1, 62)));
        assert_eq!(find_break_line(&p, 6), Some((2, 62)));
        assert_eq!(find_break_line(&p, 100), Some((5, 62)));
        assert_eq!(find_break_line(&[], 3), None);
    }

    #[test]
    fn test_find_first_break_line_snaps_forward() {
        let p = pairs(&[(3, 0), (4, 2), (9, 6)]);
        assert_eq!(find_first_break_line(&p, 1), 3);
        assert_eq!(find_first_break_line(&p, 4), 4);
        assert_eq!(find_first_break_line(&p, 5), 9);
        assert_eq!(find_first_break_line(&p, 10), 0);
    }

    #[test]
    fn test_break_list_runs() {
        let p = pairs(&[(3, 0), (4, 2), (4, 3), (5, 4), (9, 8)]);
        assert_eq!(calc_break_list(&p), vec![2, 3, 3, 1]);
        assert!(calc_break_list(&[]).is_empty());
    }

    #[test]
    fn test_break_list_out_of_order_lines() {
        // A function's closing line is recorded after its body.
        let p = pairs(&[(1, 0), (3, 8), (2, 6)]);
        assert_eq!(calc_break_list(&p), vec![0, 3]);
    }
}
