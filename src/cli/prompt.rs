use std::io::{self, BufRead, Write};

use crate::core::OperationMode;

const MODES: [OperationMode; 3] = [
    OperationMode::UpdateRightOnly,
    OperationMode::UpdateBothWithoutReset,
    OperationMode::ResetAndUpdateBoth,
];

/// Ask the operator for an operation mode until the answer is valid.
///
/// Returns `None` when the operator chooses to exit or input ends.
pub fn prompt_mode<R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
) -> io::Result<Option<OperationMode>> {
    writeln!(output, "\n=== Operation Mode Selection ===")?;
    writeln!(output, "Please select an operation mode:")?;
    for (index, mode) in MODES.iter().enumerate() {
        writeln!(output, "{}. {}", index + 1, mode.description())?;
    }
    writeln!(output, "{}. Exit", MODES.len() + 1)?;

    loop {
        write!(output, "Enter your choice (1-4): ")?;
        output.flush()?;

        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            writeln!(output)?;
            return Ok(None);
        }

        match line.trim().parse::<usize>() {
            Ok(choice @ 1..=3) => return Ok(Some(MODES[choice - 1])),
            Ok(4) => {
                writeln!(output, "Exiting...")?;
                return Ok(None);
            }
            Ok(_) => writeln!(output, "Invalid choice. Please enter 1-4.")?,
            Err(_) => writeln!(output, "Invalid input. Please enter a number between 1-4.")?,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn run(input: &str) -> (Option<OperationMode>, String) {
        let mut input = Cursor::new(input.as_bytes().to_vec());
        let mut output = Vec::new();
        let mode = prompt_mode(&mut input, &mut output).unwrap();
        (mode, String::from_utf8(output).unwrap())
    }

    #[test]
    fn test_each_choice_maps_to_a_mode() {
        assert_eq!(run("1\n").0, Some(OperationMode::UpdateRightOnly));
        assert_eq!(run("2\n").0, Some(OperationMode::UpdateBothWithoutReset));
        assert_eq!(run("3\n").0, Some(OperationMode::ResetAndUpdateBoth));
    }

    #[test]
    fn test_exit_choice() {
        let (mode, output) = run("4\n");
        assert_eq!(mode, None);
        assert!(output.contains("Exiting..."));
    }

    #[test]
    fn test_reprompts_on_invalid_input() {
        let (mode, output) = run("7\nabc\n\n 2 \n");
        assert_eq!(mode, Some(OperationMode::UpdateBothWithoutReset));
        assert!(output.contains("Invalid choice. Please enter 1-4."));
        assert_eq!(output.matches("Invalid input.").count(), 2);
        assert_eq!(output.matches("Enter your choice").count(), 4);
    }

    #[test]
    fn test_end_of_input_exits() {
        assert_eq!(run("").0, None);
        assert_eq!(run("9\n").0, None);
    }
}
