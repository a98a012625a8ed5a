use state_machines::state_machine;

state_machine! {
    name: ExtractionMachine,
    state: ExtractionState,
    initial: Ready,
    states: [Ready, TextExtracted, Drafted, Materialized, Failed],
    events {
        extract { transition: { from: Ready, to: TextExtracted } }
        draft { transition: { from: TextExtracted, to: Drafted } }
        materialize { transition: { from: Drafted, to: Materialized } }
        abort {
            transition: { from: Ready, to: Failed }
            transition: { from: TextExtracted, to: Failed }
            transition: { from: Drafted, to: Failed }
        }
    }
}

pub fn ready() -> ExtractionMachine<(), Ready> {
    ExtractionMachine::new(())
}
