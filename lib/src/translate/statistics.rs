use std::cell::Cell;
use std::fmt;

/// Counters accumulated over one translation run
#[derive(Debug, Default)]
pub struct Statistics {
    /// Classfiles read from the class path
    pub classes_loaded: Cell<usize>,

    /// Classes whose methods were all translated
    pub classes: Cell<usize>,

    /// Classes that failed to load or translate
    pub classes_failed: Cell<usize>,

    pub methods: Cell<usize>,

    /// IR instructions built by the graph builder
    pub instructions: Cell<usize>,

    /// Spill stores inserted by the graph transformer
    pub spills: Cell<usize>,

    /// Instructions removed by the graph transformer
    pub removed: Cell<usize>,

    /// Passes the bytecode producer needed for branch encodings to settle
    pub relaxation_passes: Cell<usize>,

    pub bytes: Cell<usize>,
}

impl Statistics {
    pub fn bump(counter: &Cell<usize>, by: usize) {
        counter.set(counter.get() + by);
    }
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "classes loaded:      {}", self.classes_loaded.get())?;
        writeln!(f, "classes translated:  {}", self.classes.get())?;
        writeln!(f, "classes failed:      {}", self.classes_failed.get())?;
        writeln!(f, "methods:             {}", self.methods.get())?;
        writeln!(f, "IR instructions:     {}", self.instructions.get())?;
        writeln!(f, "spills:              {}", self.spills.get())?;
        writeln!(f, "removed:             {}", self.removed.get())?;
        writeln!(f, "relaxation passes:   {}", self.relaxation_passes.get())?;
        write!(f, "bytes emitted:       {}", self.bytes.get())
    }
}
