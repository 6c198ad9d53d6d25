use moult_primitives::Addr;

/// A loaded code version, as the coordinator sees it.
///
/// The loader owns the real handle (and its unload-on-drop semantics); the
/// coordinator only ever resolves exported names and eventually drops the
/// previous version's handle once migration has finished with it.
pub trait CodeImage: Send + Sync {
	/// Resolves an exported symbol to its address in this image.
	fn resolve(&self, name: &str) -> Option<Addr>;
}
