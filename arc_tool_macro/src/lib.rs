use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use syn::spanned::Spanned;

/// Layout attributes collected from one record field.
#[derive(Default)]
struct FieldLayout {
    skip_pack: bool,
    skip_unpack: bool,
    fixed_string: Option<usize>,
    fstring_pad: u8,
    fstring_no_trim: bool,
    fixed_vec: Option<usize>,
    /// Byte width of the length prefix of a `pstring` field.
    prefix_width: Option<usize>,
}

fn lit_int<T>(attr: &syn::Attribute) -> syn::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    if let syn::Meta::NameValue(nv) = &attr.meta {
        if let syn::Expr::Lit(lit) = &nv.value {
            if let syn::Lit::Int(s) = &lit.lit {
                return s.base10_parse();
            }
        }
    }
    Err(syn::Error::new(attr.span(), "expected `name = <integer>`"))
}

impl FieldLayout {
    fn parse(field: &syn::Field) -> syn::Result<Self> {
        let mut layout = FieldLayout::default();
        for attr in &field.attrs {
            let path = attr.path();
            if path.is_ident("skip_pack") {
                layout.skip_pack = true;
            } else if path.is_ident("skip_unpack") {
                layout.skip_unpack = true;
            } else if path.is_ident("fstring") {
                layout.fixed_string = Some(lit_int(attr)?);
            } else if path.is_ident("fstring_pad") {
                layout.fstring_pad = lit_int(attr)?;
            } else if path.is_ident("fstring_no_trim") {
                layout.fstring_no_trim = true;
            } else if path.is_ident("fvec") {
                layout.fixed_vec = Some(lit_int(attr)?);
            } else if path.is_ident("pstring") {
                attr.parse_nested_meta(|meta| {
                    let width = if meta.path.is_ident("u8") {
                        1
                    } else if meta.path.is_ident("u16") {
                        2
                    } else if meta.path.is_ident("u32") {
                        4
                    } else if meta.path.is_ident("u64") {
                        8
                    } else {
                        return Err(meta.error("expected u8, u16, u32 or u64 for pstring"));
                    };
                    layout.prefix_width = Some(width);
                    Ok(())
                })?;
            }
        }
        Ok(layout)
    }
}

fn last_segment_is(ty: &syn::Type, name: &str) -> bool {
    match ty {
        syn::Type::Path(p) => p.path.segments.last().is_some_and(|s| s.ident == name),
        _ => false,
    }
}

fn field_accessor(field: &syn::Field, index: usize) -> TokenStream2 {
    match &field.ident {
        Some(ident) => quote::quote! { #ident },
        None => {
            let idx = syn::Index::from(index);
            quote::quote! { #idx }
        }
    }
}

fn binding(field: &syn::Field, index: usize) -> syn::Ident {
    match &field.ident {
        Some(ident) => ident.clone(),
        None => syn::Ident::new(&format!("field_{}", index), field.span()),
    }
}

#[proc_macro]
pub fn struct_unpack_impl_for_num(item: TokenStream) -> TokenStream {
    let i = syn::parse_macro_input!(item as syn::Ident);
    let output = quote::quote! {
        impl crate::utils::struct_pack::StructUnpack for #i {
            fn unpack<R: ::std::io::Read + ::std::io::Seek>(
                reader: &mut crate::reader::BinaryReader<R>,
                big: bool,
                _encoding: crate::types::Encoding,
            ) -> crate::error::Result<Self> {
                let buf = reader.read_array::<{ ::std::mem::size_of::<#i>() }>()?;
                Ok(if big { #i::from_be_bytes(buf) } else { #i::from_le_bytes(buf) })
            }
        }

        impl crate::utils::struct_pack::StructPack for #i {
            fn pack<W: ::std::io::Write>(
                &self,
                writer: &mut W,
                big: bool,
                _encoding: crate::types::Encoding,
            ) -> crate::error::Result<()> {
                let bytes = if big { self.to_be_bytes() } else { self.to_le_bytes() };
                writer.write_all(&bytes)?;
                Ok(())
            }
        }
    };
    output.into()
}

/// Derives `StructPack` for a directory record struct.
///
/// * `skip_pack` leaves a field out of the output.
/// * `fstring = <len>` writes a NUL padded fixed-width string; `fstring_pad = <u8>` changes the pad byte.
/// * `fvec = <len>` writes exactly `len` elements of a `Vec<_>`.
/// * `pstring(u8|u16|u32|u64)` writes a length-prefixed string.
#[proc_macro_derive(StructPack, attributes(skip_pack, fstring, fstring_pad, fvec, pstring))]
pub fn struct_pack_derive(input: TokenStream) -> TokenStream {
    let item = syn::parse_macro_input!(input as syn::ItemStruct);
    let name = &item.ident;
    let mut stmts = Vec::new();
    for (index, field) in item.fields.iter().enumerate() {
        let layout = match FieldLayout::parse(field) {
            Ok(layout) => layout,
            Err(e) => return e.to_compile_error().into(),
        };
        if layout.skip_pack {
            continue;
        }
        let access = field_accessor(field, index);
        let label = access.to_string();
        let ty = &field.ty;
        let stmt = if let (true, Some(len)) = (last_segment_is(ty, "String"), layout.fixed_string) {
            let pad = layout.fstring_pad;
            quote::quote! {
                crate::utils::struct_pack::pack_fixed_string(writer, &self.#access, #len, #pad, encoding, #label)?;
            }
        } else if let (true, Some(width)) = (last_segment_is(ty, "String"), layout.prefix_width) {
            quote::quote! {
                crate::utils::struct_pack::pack_prefixed_string(writer, &self.#access, #width, big, encoding)?;
            }
        } else if let (true, Some(len)) = (last_segment_is(ty, "Vec"), layout.fixed_vec) {
            quote::quote! {
                if self.#access.len() != #len {
                    return Err(crate::error::ArcError::InvalidInput(format!(
                        "field '{}' must hold exactly {} items", #label, #len
                    )));
                }
                for item in &self.#access {
                    crate::utils::struct_pack::StructPack::pack(item, writer, big, encoding)?;
                }
            }
        } else {
            quote::quote! {
                crate::utils::struct_pack::StructPack::pack(&self.#access, writer, big, encoding)?;
            }
        };
        stmts.push(stmt);
    }
    let output = quote::quote! {
        impl crate::utils::struct_pack::StructPack for #name {
            fn pack<W: ::std::io::Write>(
                &self,
                writer: &mut W,
                big: bool,
                encoding: crate::types::Encoding,
            ) -> crate::error::Result<()> {
                #(#stmts)*
                Ok(())
            }
        }
    };
    output.into()
}

/// Derives `StructUnpack` for a directory record struct.
///
/// Every read goes through the bounded reader, so a record that crosses
/// the end of the container fails instead of yielding garbage.
///
/// * `skip_unpack` fills a field with `Default::default()`.
/// * `fstring = <len>` reads a fixed-width string cut at the first NUL, unless `fstring_no_trim` is set.
/// * `fvec = <len>` reads exactly `len` elements.
/// * `pstring(u8|u16|u32|u64)` reads a length-prefixed string.
#[proc_macro_derive(StructUnpack, attributes(skip_unpack, fstring, fstring_no_trim, fvec, pstring))]
pub fn struct_unpack_derive(input: TokenStream) -> TokenStream {
    let item = syn::parse_macro_input!(input as syn::ItemStruct);
    let name = &item.ident;
    let tuple = matches!(item.fields, syn::Fields::Unnamed(_));
    let mut names = Vec::new();
    let mut stmts = Vec::new();
    for (index, field) in item.fields.iter().enumerate() {
        let layout = match FieldLayout::parse(field) {
            Ok(layout) => layout,
            Err(e) => return e.to_compile_error().into(),
        };
        let var = binding(field, index);
        names.push(var.clone());
        let ty = &field.ty;
        let stmt = if layout.skip_unpack {
            quote::quote! { let #var = ::std::default::Default::default(); }
        } else if let (true, Some(len)) = (last_segment_is(ty, "String"), layout.fixed_string) {
            let trim = !layout.fstring_no_trim;
            quote::quote! { let #var = reader.read_fstring(#len, encoding, #trim)?; }
        } else if let (true, Some(width)) = (last_segment_is(ty, "String"), layout.prefix_width) {
            quote::quote! { let #var = reader.read_prefixed_string(#width, big, encoding)?; }
        } else if let (true, Some(len)) = (last_segment_is(ty, "Vec"), layout.fixed_vec) {
            quote::quote! {
                let #var = (0..#len)
                    .map(|_| crate::utils::struct_pack::StructUnpack::unpack(reader, big, encoding))
                    .collect::<crate::error::Result<Vec<_>>>()?;
            }
        } else {
            quote::quote! {
                let #var = <#ty as crate::utils::struct_pack::StructUnpack>::unpack(reader, big, encoding)?;
            }
        };
        stmts.push(stmt);
    }
    let build = if tuple {
        quote::quote! { Self(#(#names),*) }
    } else {
        quote::quote! { Self { #(#names),* } }
    };
    let output = quote::quote! {
        impl crate::utils::struct_pack::StructUnpack for #name {
            fn unpack<R: ::std::io::Read + ::std::io::Seek>(
                reader: &mut crate::reader::BinaryReader<R>,
                big: bool,
                encoding: crate::types::Encoding,
            ) -> crate::error::Result<Self> {
                #(#stmts)*
                Ok(#build)
            }
        }
    };
    output.into()
}
