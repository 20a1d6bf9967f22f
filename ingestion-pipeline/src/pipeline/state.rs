use state_machines::state_machine;

state_machine! {
    name: DocumentMachine,
    state: DocumentState,
    initial: Ready,
    states: [Ready, Parsed, Chunked, Persisted, Indexed, Failed],
    events {
        parse { transition: { from: Ready, to: Parsed } }
        chunk { transition: { from: Parsed, to: Chunked } }
        persist { transition: { from: Chunked, to: Persisted } }
        index { transition: { from: Persisted, to: Indexed } }
        abort {
            transition: { from: Ready, to: Failed }
            transition: { from: Parsed, to: Failed }
            transition: { from: Chunked, to: Failed }
            transition: { from: Persisted, to: Failed }
            transition: { from: Indexed, to: Failed }
        }
    }
}

pub fn ready() -> DocumentMachine<(), Ready> {
    DocumentMachine::new(())
}
