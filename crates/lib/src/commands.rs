//! Quick-command catalog shown next to the console input.

/// One quick command: a label and the text it prefills.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuickCommand {
    pub label: &'static str,
    pub example: &'static str,
}

#[derive(Debug, Clone, Copy)]
pub struct CommandSection {
    pub title: &'static str,
    pub commands: &'static [QuickCommand],
}

pub const SECTIONS: &[CommandSection] = &[
    CommandSection {
        title: "Record Agent Tools",
        commands: &[
            QuickCommand { label: "Check DO", example: "check do" },
            QuickCommand { label: "Check Holding Area", example: "check holding area" },
            QuickCommand { label: "Check Full Treatment", example: "check full treatment" },
            QuickCommand { label: "Check Full NCR", example: "check full ncr" },
        ],
    },
    CommandSection {
        title: "Admin Functions",
        commands: &[
            QuickCommand { label: "Generate DO", example: "generate do" },
            QuickCommand { label: "DO Download Link", example: "do download link" },
            QuickCommand { label: "Parse Supplier DO", example: "parse supplier do" },
        ],
    },
    CommandSection {
        title: "Account Functions",
        commands: &[
            QuickCommand { label: "Approve PO", example: "approve po 12345" },
            QuickCommand { label: "Partial PO", example: "partial po 12345 qty 10" },
            QuickCommand { label: "Reject PO", example: "reject po 12345" },
            QuickCommand { label: "USD to SGD Rate", example: "usd to sgd rate" },
        ],
    },
];

/// Find a quick command by label, case-insensitively.
pub fn find(label: &str) -> Option<&'static QuickCommand> {
    let label = label.trim();
    SECTIONS
        .iter()
        .flat_map(|s| s.commands.iter())
        .find(|c| c.label.eq_ignore_ascii_case(label))
}

/// Catalog as plain text, one section per block.
pub fn help_text() -> String {
    let mut out = String::new();
    for section in SECTIONS {
        out.push_str(section.title);
        out.push('\n');
        for c in section.commands {
            out.push_str(&format!("  {:<22} {}\n", c.label, c.example));
        }
    }
    out
}
